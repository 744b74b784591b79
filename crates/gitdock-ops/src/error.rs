//! Error types for configuration handling.
//!
//! Repository operations report [`gitdock_core::RepoError`]; this type covers
//! loading and editing the configuration file.

use thiserror::Error;

/// Result type for configuration operations.
pub type OpsResult<T> = Result<T, OpsError>;

/// Errors raised while reading or editing configuration.
#[derive(Debug, Error)]
pub enum OpsError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
