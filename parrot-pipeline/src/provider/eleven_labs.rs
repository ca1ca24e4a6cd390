//! ElevenLabs API client
//!
//! Training: `POST {base}/voices/add` (multipart `name`, `description`,
//! `files`) returns `{"voice_id": ...}`, which becomes the model reference.
//! The voice is named after the sample id; `GET {base}/voices` lists voices
//! by name so a retried training can reuse one created by an earlier attempt.
//! Cloning: `POST {base}/text-to-speech/{voice_id}/stream` with a JSON body
//! returns encoded audio. Errors come back as
//! `{"detail": {"status": ..., "message": ...}}`.

use std::time::Duration;

use async_trait::async_trait;
use parrot_common::config::ProviderConfig;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};

use super::{ProviderError, SynthesisProvider, TrainingSample};

const USER_AGENT: &str = concat!("parrot/", env!("CARGO_PKG_VERSION"));
const STREAMING_LATENCY: &str = "optimize_streaming_latency=3";

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    detail: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AddVoiceResponse {
    voice_id: String,
}

#[derive(Debug, Deserialize)]
struct ListedVoice {
    voice_id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ListVoicesResponse {
    voices: Vec<ListedVoice>,
}

#[derive(Debug, Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
    style: f32,
    use_speaker_boost: bool,
}

#[derive(Debug, Serialize)]
struct TextToSpeechRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

/// HTTP client for the ElevenLabs voice API
pub struct ElevenLabsClient {
    http_client: reqwest::Client,
    base_url: String,
    model_id: String,
}

impl ElevenLabsClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.api_key).map_err(|e| ProviderError::Terminal {
            status: None,
            message: format!("invalid API key header: {}", e),
        })?;
        headers.insert("xi-api-key", key);

        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(config.request_timeout())
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ProviderError::Terminal {
                status: None,
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model_id: config.model_id.clone(),
        })
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(err) => err.detail.message,
            Err(_) if body.is_empty() => status.to_string(),
            Err(_) => body,
        };

        tracing::warn!(status = status.as_u16(), message = %message, "Provider returned error");
        Err(ProviderError::from_status(status.as_u16(), message))
    }
}

fn network_error(err: reqwest::Error) -> ProviderError {
    ProviderError::Transient {
        status: err.status().map(|s| s.as_u16()),
        message: err.to_string(),
    }
}

#[async_trait]
impl SynthesisProvider for ElevenLabsClient {
    async fn train_voice(&self, sample: TrainingSample) -> Result<String, ProviderError> {
        let url = format!("{}/voices/add", self.base_url);
        tracing::debug!(voice_id = %sample.voice_id, url = %url, size = sample.bytes.len(), "Submitting voice sample");

        let part = Part::bytes(sample.bytes)
            .file_name(sample.file_name)
            .mime_str("audio/mpeg")
            .map_err(|e| ProviderError::Terminal {
                status: None,
                message: e.to_string(),
            })?;
        let form = Form::new()
            .text("name", sample.sample_id.clone())
            .text("description", format!("parrot voice {}", sample.voice_id))
            .part("files", part);

        let response = self
            .http_client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(network_error)?;
        let response = Self::check_status(response).await?;

        let body: AddVoiceResponse = response.json().await.map_err(|e| ProviderError::Terminal {
            status: None,
            message: format!("unexpected training response: {}", e),
        })?;

        tracing::info!(voice_id = %sample.voice_id, model_ref = %body.voice_id, "Voice trained by provider");
        Ok(body.voice_id)
    }

    async fn find_voice(&self, name: &str) -> Result<Option<String>, ProviderError> {
        let url = format!("{}/voices", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(network_error)?;
        let response = Self::check_status(response).await?;

        let body: ListVoicesResponse = response.json().await.map_err(|e| ProviderError::Transient {
            status: None,
            message: format!("unexpected voice listing: {}", e),
        })?;

        let found = body
            .voices
            .into_iter()
            .find(|voice| voice.name == name)
            .map(|voice| voice.voice_id);
        tracing::debug!(name, found = found.is_some(), "Looked up provider voice");
        Ok(found)
    }

    async fn synthesize(&self, model_ref: &str, text: &str) -> Result<Vec<u8>, ProviderError> {
        let url = format!(
            "{}/text-to-speech/{}/stream?{}",
            self.base_url, model_ref, STREAMING_LATENCY
        );
        let payload = TextToSpeechRequest {
            text,
            model_id: &self.model_id,
            voice_settings: VoiceSettings {
                stability: 0.0,
                similarity_boost: 0.0,
                style: 0.5,
                use_speaker_boost: true,
            },
        };

        tracing::debug!(model_ref, chars = text.chars().count(), "Requesting synthesis");

        let response = self
            .http_client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(network_error)?;
        let response = Self::check_status(response).await?;

        let audio = response.bytes().await.map_err(network_error)?;
        Ok(audio.to_vec())
    }
}
