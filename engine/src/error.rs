//! Error types for the Tether engine.

use thiserror::Error;

/// All possible errors from the Tether engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Schema errors
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("unknown field '{field}' on collection '{collection}'")]
    UnknownField { collection: String, field: String },

    #[error("unknown relation '{relation}' on collection '{collection}'")]
    UnknownRelation {
        collection: String,
        relation: String,
    },

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    // Mutation errors
    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("record already exists: {0}")]
    RecordAlreadyExists(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    // Query errors
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
