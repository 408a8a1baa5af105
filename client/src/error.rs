//! Client error types.

use tether_engine::ErrorCode;
use thiserror::Error;

/// All possible errors from the Tether client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Engine(#[from] tether_engine::Error),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("connection closed")]
    Closed,

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("relation fetch failed: {0}")]
    Fetch(String),

    #[error("server error ({code:?}): {message}")]
    Server { code: ErrorCode, message: String },

    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
