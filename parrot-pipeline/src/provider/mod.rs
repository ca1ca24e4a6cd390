//! Synthesis provider seam
//!
//! The pipeline talks to the voice-synthesis service only through
//! [`SynthesisProvider`]: one training call (sample in, model reference out)
//! and one cloning call (model reference plus text in, audio out). Failures
//! are classified as transient or terminal from the HTTP status.

use async_trait::async_trait;
use thiserror::Error;

pub mod eleven_labs;

pub use eleven_labs::ElevenLabsClient;

/// Provider call failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Network fault, timeout, throttling or 5xx; worth retrying
    #[error("provider unavailable (status {status:?}): {message}")]
    Transient { status: Option<u16>, message: String },

    /// Request rejected; retrying cannot succeed
    #[error("provider rejected request (status {status:?}): {message}")]
    Terminal { status: Option<u16>, message: String },
}

impl ProviderError {
    /// Classify a non-success HTTP status
    ///
    /// 408, 425, 429 and 5xx are transient; every other status is terminal.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if matches!(status, 408 | 425 | 429) || (500..=599).contains(&status) {
            ProviderError::Transient {
                status: Some(status),
                message,
            }
        } else {
            ProviderError::Terminal {
                status: Some(status),
                message,
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }
}

/// Sample handed to the training call
#[derive(Debug, Clone)]
pub struct TrainingSample {
    pub voice_id: String,
    /// Sample id; names the provider-side voice so a retry can find it
    pub sample_id: String,
    /// Original object file name, used as the upload part name
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// External voice training and cloning service
#[async_trait]
pub trait SynthesisProvider: Send + Sync {
    /// Train a voice from a sample; returns the provider-side model reference
    async fn train_voice(&self, sample: TrainingSample) -> Result<String, ProviderError>;

    /// Model reference of a voice already created under `name`, if any
    ///
    /// A training call whose response was lost may still have created the
    /// voice. Providers that cannot list voices always train afresh.
    async fn find_voice(&self, _name: &str) -> Result<Option<String>, ProviderError> {
        Ok(None)
    }

    /// Speak `text` in the voice identified by `model_ref`; returns encoded audio
    async fn synthesize(&self, model_ref: &str, text: &str) -> Result<Vec<u8>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        for status in [408, 425, 429, 500, 502, 503, 504] {
            assert!(ProviderError::from_status(status, "x").is_transient(), "{}", status);
        }
        for status in [400, 401, 403, 404, 413, 422] {
            assert!(!ProviderError::from_status(status, "x").is_transient(), "{}", status);
        }
    }
}
