//! Error types for checkpoint operations.

use thiserror::Error;

/// Convenience result type using [`CheckpointError`].
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors raised by checkpoint stores and the portable encoding layer.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// The requested checkpoint does not exist in the store.
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    /// The request was malformed (missing run id, empty checkpoint, ...).
    #[error("Invalid checkpoint request: {0}")]
    Invalid(String),

    /// JSON encoding or decoding of a payload failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary encoding or decoding of a payload failed.
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// Backend-specific storage failure.
    #[error("Checkpoint store error: {0}")]
    Store(String),
}
