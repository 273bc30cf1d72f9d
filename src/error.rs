//! Error types for the Stickerboard engine.

use thiserror::Error;

/// All errors produced by engine operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// A shared lock was poisoned by a panicking thread.
    #[error("Lock poisoned")]
    Lock,

    /// Configuration failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An image fetch failed.
    #[error("Failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    /// The operation was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// A fetched image could not be decoded or resampled.
    #[error("Image decode error: {0}")]
    Decode(String),

    /// The background worker answered with an error response.
    #[error("Worker error: {0}")]
    Worker(String),

    /// The background worker is gone or did not answer in time.
    #[error("Worker unavailable")]
    WorkerUnavailable,

    /// A worker frame could not be encoded or decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<bincode::Error> for EngineError {
    fn from(err: bincode::Error) -> Self {
        EngineError::Protocol(err.to_string())
    }
}
