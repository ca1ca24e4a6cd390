//! Common error types for the parrot pipeline

use thiserror::Error;

/// Common result type for parrot operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the parrot services
#[derive(Error, Debug)]
pub enum Error {
    /// Metadata store operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding of queue bodies or stored documents
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Another writer created the same object version first
    #[error("Storage version conflict: {bucket}/{key} version {version} already exists")]
    StorageVersionConflict {
        bucket: String,
        key: String,
        version: u64,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for faults that may succeed when retried (lock contention, I/O, version races)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Database(_) | Error::Io(_) | Error::StorageVersionConflict { .. }
        )
    }
}
