//! Error types for parrot-pipeline
//!
//! [`StageError`] classifies every failure a stage handler can report. The
//! worker uses the classification alone to decide between retrying,
//! absorbing and failing the job.

use thiserror::Error;

use crate::provider::ProviderError;

/// Stage handler failure
#[derive(Debug, Error)]
pub enum StageError {
    /// Malformed job or entity reference; never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// Network fault, timeout or 5xx from the synthesis provider
    #[error("Transient provider error: {0}")]
    TransientProvider(String),

    /// Provider rejected the request (4xx, semantic rejection)
    #[error("Terminal provider error: {0}")]
    TerminalProvider(String),

    /// The job's side effect already happened; absorbed without change
    #[error("Duplicate delivery: {0}")]
    DuplicateDelivery(String),

    /// Another writer claimed the object version first
    #[error("Storage version conflict: {0}")]
    StorageVersionConflict(String),

    /// A precondition is not met yet (e.g. profile still training)
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Object storage I/O fault
    #[error("Storage error: {0}")]
    Storage(String),

    /// Metadata store fault
    #[error("Metadata store error: {0}")]
    Metadata(String),
}

impl StageError {
    /// True when redelivering the job may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            StageError::TransientProvider(_)
            | StageError::StorageVersionConflict(_)
            | StageError::NotReady(_)
            | StageError::Storage(_)
            | StageError::Metadata(_) => true,
            StageError::Validation(_)
            | StageError::TerminalProvider(_)
            | StageError::DuplicateDelivery(_) => false,
        }
    }
}

impl From<parrot_common::Error> for StageError {
    fn from(err: parrot_common::Error) -> Self {
        use parrot_common::Error;

        match err {
            Error::StorageVersionConflict { .. } => StageError::StorageVersionConflict(err.to_string()),
            Error::Io(_) => StageError::Storage(err.to_string()),
            Error::Database(_) | Error::Internal(_) => StageError::Metadata(err.to_string()),
            // Encoding fails the same way on every delivery
            Error::Serialization(_) => StageError::Validation(err.to_string()),
            Error::NotFound(msg) | Error::InvalidInput(msg) | Error::Config(msg) => {
                StageError::Validation(msg)
            }
        }
    }
}

impl From<ProviderError> for StageError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transient { .. } => StageError::TransientProvider(err.to_string()),
            ProviderError::Terminal { .. } => StageError::TerminalProvider(err.to_string()),
        }
    }
}

/// Result type for stage handlers
pub type StageResult<T> = Result<T, StageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(StageError::TransientProvider("503".into()).is_retryable());
        assert!(StageError::NotReady("training".into()).is_retryable());
        assert!(StageError::StorageVersionConflict("v2".into()).is_retryable());
        assert!(!StageError::TerminalProvider("400".into()).is_retryable());
        assert!(!StageError::Validation("bad".into()).is_retryable());
        assert!(!StageError::DuplicateDelivery("seen".into()).is_retryable());
    }

    #[test]
    fn test_common_errors_map_to_stage_errors() {
        let conflict: StageError = parrot_common::Error::StorageVersionConflict {
            bucket: "outputs".into(),
            key: "v/output-r".into(),
            version: 2,
        }
        .into();
        assert!(matches!(conflict, StageError::StorageVersionConflict(_)));

        let missing: StageError = parrot_common::Error::NotFound("samples/x".into()).into();
        assert!(matches!(missing, StageError::Validation(_)));

        let io: StageError = parrot_common::Error::from(std::io::Error::other("disk")).into();
        assert!(matches!(io, StageError::Storage(_)));
        assert!(io.is_retryable());

        let decode = serde_json::from_str::<u32>("not a number").unwrap_err();
        let serialization: StageError = parrot_common::Error::from(decode).into();
        assert!(matches!(serialization, StageError::Validation(_)));
        assert!(!serialization.is_retryable());
    }
}
