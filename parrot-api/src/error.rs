//! Error types for parrot-api
//!
//! Every failure is rendered as `{"error": {"code": ..., "message": ...}}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use parrot_common::signing::SigningError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid client input (400); never retried
    #[error("Invalid request: {0}")]
    Validation(String),

    /// State does not allow the operation (409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Result not produced yet (409)
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Signed reference rejected (403)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<parrot_common::Error> for ApiError {
    fn from(err: parrot_common::Error) -> Self {
        use parrot_common::Error;
        match err {
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::InvalidInput(msg) => ApiError::Validation(msg),
            Error::StorageVersionConflict { .. } => ApiError::Conflict(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<SigningError> for ApiError {
    fn from(err: SigningError) -> Self {
        ApiError::Forbidden(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::NotReady(msg) => (StatusCode::CONFLICT, "NOT_READY", msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg),
            ApiError::Internal(msg) => {
                error!("Request failed: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg)
            }
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_errors_map_to_codes() {
        let err: ApiError = parrot_common::Error::NotFound("clone x".to_string()).into();
        assert!(matches!(err, ApiError::NotFound(_)));

        let err: ApiError = parrot_common::Error::InvalidInput("bad key".to_string()).into();
        assert!(matches!(err, ApiError::Validation(_)));

        let err: ApiError = parrot_common::Error::Internal("boom".to_string()).into();
        assert!(matches!(err, ApiError::Internal(_)));
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(ApiError::NotReady("x".into()).into_response().status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::Forbidden("x".into()).into_response().status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::Validation("x".into()).into_response().status(), StatusCode::BAD_REQUEST);
    }
}
