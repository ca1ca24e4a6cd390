//! Clone request submission and status
//!
//! A request for a trained voice is enqueued immediately. A request for a
//! voice whose sample is still being ingested or trained is stored `queued`;
//! the train-voice consumer enqueues it once the profile is trained. The
//! request row is written before the profile is re-read, so a profile that
//! becomes trained in between is seen by one side or the other (duplicate
//! enqueues share a job id and collapse).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use parrot_common::db::{artifacts, clones, profiles, samples};
use parrot_common::job::JobEnvelope;
use parrot_common::models::{
    validate_voice_id, CloneRequest, CloneStatus, ProfileStatus, SampleStatus, VoiceProfile,
    VoiceSample,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::outputs::{output_reference, OutputReference};
use crate::{ApiError, ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct SubmitCloneRequest {
    pub voice_id: String,
    pub text: String,
}

/// Clone request plus its retrieval reference once done
#[derive(Debug, Serialize)]
pub struct CloneResponse {
    #[serde(flatten)]
    pub request: CloneRequest,
    pub output: Option<OutputReference>,
}

impl CloneResponse {
    async fn load(state: &AppState, request: CloneRequest) -> ApiResult<Self> {
        let mut output = None;
        if request.status == CloneStatus::Done {
            if let Some(artifact_id) = &request.output_artifact_id {
                if let Some(artifact) = artifacts::get(&state.db, artifact_id).await? {
                    output = output_reference(state, &artifact);
                }
            }
        }
        Ok(Self { request, output })
    }
}

async fn load_request(state: &AppState, id: &str) -> ApiResult<CloneRequest> {
    clones::get(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("clone request {}", id)))
}

/// A newer, not rejected sample will retrain a failed voice
fn retraining_pending(profile: &VoiceProfile, latest: Option<&VoiceSample>) -> bool {
    latest.is_some_and(|s| {
        s.status != SampleStatus::Failed && profile.source_sample_id.as_deref() != Some(s.id.as_str())
    })
}

/// Enqueue the clone job for `request` if its voice is trained
///
/// Returns the failure reason when the voice profile has failed and no
/// retraining is pending.
async fn enqueue_if_trained(state: &AppState, request: &CloneRequest) -> ApiResult<Option<String>> {
    let Some(profile) = profiles::get(&state.db, &request.voice_id).await? else {
        return Ok(None);
    };

    match profile.status {
        ProfileStatus::Trained => {
            let job = JobEnvelope::clone_voice(&request.voice_id, &request.id, request.generation);
            state
                .queue
                .send(&state.config.queues.clone_voice, &job)
                .await?;
            debug!(job_id = %job.job_id, voice_id = %request.voice_id, "Clone job enqueued");
            Ok(None)
        }
        ProfileStatus::Failed => {
            let latest = samples::latest_for_voice(&state.db, &request.voice_id).await?;
            if retraining_pending(&profile, latest.as_ref()) {
                return Ok(None);
            }
            Ok(Some(
                profile
                    .failure_reason
                    .unwrap_or_else(|| "voice training failed".to_string()),
            ))
        }
        ProfileStatus::Queued | ProfileStatus::Training => Ok(None),
    }
}

/// Reject submissions for voices that cannot become trained
async fn check_voice(state: &AppState, voice_id: &str) -> ApiResult<()> {
    let profile = profiles::get(&state.db, voice_id).await?;
    let sample = samples::latest_for_voice(&state.db, voice_id).await?;

    match (&profile, &sample) {
        (None, None) => Err(ApiError::NotFound(format!("voice {} has no samples", voice_id))),
        (None, Some(sample)) if sample.status == SampleStatus::Failed => Err(ApiError::NotReady(format!(
            "voice {} sample was rejected: {}",
            voice_id,
            sample.failure_reason.as_deref().unwrap_or("unknown reason")
        ))),
        (Some(profile), latest) if profile.status == ProfileStatus::Failed => {
            if retraining_pending(profile, latest.as_ref()) {
                Ok(())
            } else {
                Err(ApiError::NotReady(format!(
                    "voice {} training failed: {}",
                    voice_id,
                    profile.failure_reason.as_deref().unwrap_or("unknown reason")
                )))
            }
        }
        _ => Ok(()),
    }
}

/// POST /clones
pub async fn submit_clone(
    State(state): State<AppState>,
    Json(body): Json<SubmitCloneRequest>,
) -> ApiResult<(StatusCode, Json<CloneResponse>)> {
    validate_voice_id(&body.voice_id)?;

    let text = body.text.trim();
    if text.is_empty() {
        return Err(ApiError::Validation("text must not be empty".to_string()));
    }
    let max_chars = state.config.api.max_text_chars;
    if text.chars().count() > max_chars {
        return Err(ApiError::Validation(format!(
            "text exceeds {} characters",
            max_chars
        )));
    }

    check_voice(&state, &body.voice_id).await?;

    let request = CloneRequest::new(&body.voice_id, text);
    clones::create(&state.db, &request).await?;
    info!(clone_request_id = %request.id, voice_id = %request.voice_id, "Clone request submitted");

    if let Some(reason) = enqueue_if_trained(&state, &request).await? {
        clones::mark_failed(
            &state.db,
            &request.id,
            request.generation,
            &format!("voice training failed: {}", reason),
        )
        .await?;
    }

    let request = load_request(&state, &request.id).await?;
    let response = CloneResponse::load(&state, request).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /clones/:id
pub async fn get_clone(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<CloneResponse>> {
    let request = load_request(&state, &id).await?;
    Ok(Json(CloneResponse::load(&state, request).await?))
}

/// GET /clones/:id/output
pub async fn get_clone_output(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<OutputReference>> {
    let request = load_request(&state, &id).await?;
    match request.status {
        CloneStatus::Done => {}
        CloneStatus::Failed => {
            return Err(ApiError::Conflict(format!(
                "clone request {} failed: {}",
                id,
                request.failure_reason.as_deref().unwrap_or("unknown reason")
            )))
        }
        status => {
            return Err(ApiError::NotReady(format!(
                "clone request {} is {}",
                id, status
            )))
        }
    }

    let artifact_id = request
        .output_artifact_id
        .as_deref()
        .ok_or_else(|| ApiError::Internal(format!("clone request {} is done without an artifact", id)))?;
    let artifact = artifacts::get(&state.db, artifact_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("artifact {}", artifact_id)))?;

    output_reference(&state, &artifact)
        .map(Json)
        .ok_or_else(|| ApiError::NotReady(format!("artifact {} is not stored", artifact_id)))
}

/// POST /clones/:id/regenerate
///
/// Starts a new generation for a done or failed request. The output lands as
/// a new version of the same key.
pub async fn regenerate_clone(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<CloneResponse>)> {
    let Some(generation) = clones::regenerate(&state.db, &id).await? else {
        let request = load_request(&state, &id).await?;
        return Err(ApiError::Conflict(format!(
            "clone request {} is still {}",
            id, request.status
        )));
    };

    let request = load_request(&state, &id).await?;
    info!(clone_request_id = %id, generation, "Clone request regenerated");

    if let Some(reason) = enqueue_if_trained(&state, &request).await? {
        clones::mark_failed(
            &state.db,
            &request.id,
            generation,
            &format!("voice training failed: {}", reason),
        )
        .await?;
    }

    let request = load_request(&state, &id).await?;
    let response = CloneResponse::load(&state, request).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}
