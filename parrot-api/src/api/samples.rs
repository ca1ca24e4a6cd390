//! Sample upload gateway
//!
//! Writes the request body into the samples bucket as a new object version
//! and publishes the object-created notification the ingestion trigger
//! consumes. Objects with a sample suffix also get a `pending` VoiceSample
//! row so the voice is known before the trigger runs.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use parrot_common::db::samples;
use parrot_common::job::ObjectCreated;
use parrot_common::models::{validate_voice_id, VoiceSample};
use parrot_common::storage::validate_key;
use serde::Serialize;
use tracing::info;

use crate::{ApiError, ApiResult, AppState};

/// Upload acknowledgement
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub bucket: String,
    pub key: String,
    pub version: u64,
    pub size_bytes: u64,
    /// Notification id; also the ingestion job id
    pub event_id: String,
}

/// PUT /samples/:voice_id/:file_name
pub async fn upload_sample(
    State(state): State<AppState>,
    Path((voice_id, file_name)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<UploadResponse>)> {
    validate_voice_id(&voice_id)?;
    let key = format!("{}/{}", voice_id, file_name);
    validate_key(&key)?;
    if body.is_empty() {
        return Err(ApiError::Validation("sample body is empty".to_string()));
    }

    let bucket = &state.config.storage.samples_bucket;
    let stored = state.store.put(bucket, &key, &body).await?;

    // Sample objects are visible to status queries before the trigger runs
    if state.config.storage.is_sample_key(&stored.key) {
        samples::record(&state.db, &VoiceSample::pending(&voice_id, &stored)).await?;
    }

    let event = ObjectCreated::new(&stored.bucket, &stored.key, stored.version, stored.size_bytes);
    state
        .queue
        .send(&state.config.queues.sample_events, &event)
        .await?;

    info!(
        voice_id = %voice_id,
        key = %stored.key,
        version = stored.version,
        size = stored.size_bytes,
        "Sample uploaded"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            bucket: stored.bucket,
            key: stored.key,
            version: stored.version,
            size_bytes: stored.size_bytes,
            event_id: event.event_id,
        }),
    ))
}
