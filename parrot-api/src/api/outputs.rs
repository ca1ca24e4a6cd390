//! Output artifacts and signed retrieval
//!
//! Outputs are never publicly readable. Status responses carry a signed
//! reference to one stored version; `GET /outputs/*key` serves exactly that
//! version while the reference is valid.

use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use parrot_common::db::artifacts;
use parrot_common::models::{ArtifactStatus, OutputArtifact};
use parrot_common::signing::{sign_reference, verify_reference, SignedReference};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{ApiError, ApiResult, AppState};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Retrieval reference for a stored artifact
#[derive(Debug, Serialize)]
pub struct OutputReference {
    pub artifact_id: String,
    pub checksum: Option<String>,
    pub content_type: Option<String>,
    pub size_bytes: Option<u64>,
    /// url, bucket, key, version, expires_at, signature
    #[serde(flatten)]
    pub download: SignedReference,
}

/// Sign a reference to a stored artifact; `None` until the artifact is stored
pub(crate) fn output_reference(state: &AppState, artifact: &OutputArtifact) -> Option<OutputReference> {
    if artifact.status != ArtifactStatus::Stored {
        return None;
    }
    let version = artifact.version?;
    let storage = &state.config.storage;

    let download = sign_reference(
        &storage.signing_secret,
        &storage.public_base_url,
        &storage.outputs_bucket,
        &artifact.storage_key,
        version,
        storage.signed_url_ttl(),
        Utc::now(),
    );

    Some(OutputReference {
        artifact_id: artifact.id.clone(),
        checksum: artifact.checksum.clone(),
        content_type: artifact.content_type.clone(),
        size_bytes: artifact.size_bytes,
        download,
    })
}

/// Artifact record plus a retrieval reference once stored
#[derive(Debug, Serialize)]
pub struct ArtifactResponse {
    #[serde(flatten)]
    pub artifact: OutputArtifact,
    pub output: Option<OutputReference>,
}

/// GET /artifacts/:id
pub async fn get_artifact(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ArtifactResponse>> {
    let artifact = artifacts::get(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("artifact {}", id)))?;

    let output = output_reference(&state, &artifact);
    Ok(Json(ArtifactResponse { artifact, output }))
}

/// Signed reference query parameters
#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub version: Option<u64>,
    pub expires: Option<i64>,
    pub signature: Option<String>,
}

/// GET /outputs/*key?version=&expires=&signature=
pub async fn download_output(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<impl IntoResponse> {
    let (Some(version), Some(expires), Some(signature)) = (query.version, query.expires, query.signature)
    else {
        return Err(ApiError::Validation(
            "version, expires and signature are required".to_string(),
        ));
    };

    let storage = &state.config.storage;
    verify_reference(
        &storage.signing_secret,
        &storage.outputs_bucket,
        &key,
        version,
        expires,
        &signature,
        Utc::now(),
    )?;

    let (_, bytes) = state.store.get(&storage.outputs_bucket, &key, Some(version)).await?;
    let content_type = artifacts::find_stored_version(&state.db, &key, version)
        .await?
        .and_then(|artifact| artifact.content_type)
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

    debug!(key = %key, version, size = bytes.len(), "Serving output version");
    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}
