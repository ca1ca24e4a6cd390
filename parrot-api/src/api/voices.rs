//! Voice status

use axum::{
    extract::{Path, State},
    Json,
};
use parrot_common::db::{profiles, samples};
use parrot_common::models::{validate_voice_id, VoiceProfile, VoiceSample};
use serde::Serialize;

use crate::{ApiError, ApiResult, AppState};

#[derive(Debug, Serialize)]
pub struct VoiceResponse {
    pub voice_id: String,
    pub profile: Option<VoiceProfile>,
    pub latest_sample: Option<VoiceSample>,
}

/// GET /voices
pub async fn list_voices(State(state): State<AppState>) -> ApiResult<Json<Vec<VoiceProfile>>> {
    Ok(Json(profiles::list(&state.db).await?))
}

/// GET /voices/:voice_id
pub async fn get_voice(
    State(state): State<AppState>,
    Path(voice_id): Path<String>,
) -> ApiResult<Json<VoiceResponse>> {
    validate_voice_id(&voice_id)?;

    let profile = profiles::get(&state.db, &voice_id).await?;
    let latest_sample = samples::latest_for_voice(&state.db, &voice_id).await?;
    if profile.is_none() && latest_sample.is_none() {
        return Err(ApiError::NotFound(format!("voice {}", voice_id)));
    }

    Ok(Json(VoiceResponse {
        voice_id,
        profile,
        latest_sample,
    }))
}
