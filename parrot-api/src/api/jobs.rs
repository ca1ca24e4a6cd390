//! Job status and dead-letter inspection

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use parrot_common::db::ledger::{self, JobOutcome};
use parrot_common::queue::{DeadLetter, MessageState};
use serde::{Deserialize, Serialize};

use crate::{ApiError, ApiResult, AppState};

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    /// queued, in_flight, processed, absorbed, failed or dead_lettered
    pub status: &'static str,
    pub queue: String,
    /// Deliveries so far
    pub attempts: Option<u32>,
    pub detail: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// GET /jobs/*job_id
///
/// The processed-job ledger is authoritative once a job has finished; until
/// then the queue record reports where the message is.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStatusResponse>> {
    let record = state.queue.find(&job_id).await?;
    let attempts = record.as_ref().map(|r| r.receive_count);

    if let Some(entry) = ledger::get(&state.db, &job_id).await? {
        let status = match entry.outcome {
            JobOutcome::Completed => "processed",
            JobOutcome::Absorbed => "absorbed",
            JobOutcome::Failed => "failed",
            JobOutcome::DeadLettered => "dead_lettered",
        };
        return Ok(Json(JobStatusResponse {
            job_id,
            status,
            queue: entry.queue,
            attempts,
            detail: entry.detail,
            updated_at: entry.processed_at,
        }));
    }

    let record = record.ok_or_else(|| ApiError::NotFound(format!("job {}", job_id)))?;
    let status = match record.state {
        MessageState::Pending => "queued",
        MessageState::InFlight => "in_flight",
        MessageState::Acked => "processed",
        MessageState::Dead => "dead_lettered",
    };

    Ok(Json(JobStatusResponse {
        job_id,
        status,
        queue: record.queue,
        attempts,
        detail: None,
        updated_at: record.updated_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub queue: Option<String>,
}

/// GET /dead-letters?queue=
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> ApiResult<Json<Vec<DeadLetter>>> {
    Ok(Json(state.queue.dead_letters(query.queue.as_deref()).await?))
}
