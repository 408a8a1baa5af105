//! Unified error handling for the server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tether_engine::{ErrorCode, ServerFrame};

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Engine(#[from] tether_engine::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown resource: {0}")]
    InvalidResource(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    Conflict(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// The wire-level error code shared by the frame and HTTP surfaces.
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Database(_) | AppError::Internal(_) => ErrorCode::InternalServerError,
            AppError::Engine(tether_engine::Error::InvalidQuery(_)) => ErrorCode::InvalidQuery,
            AppError::Engine(_) => ErrorCode::InvalidRequest,
            AppError::InvalidRequest(_) | AppError::Conflict(_) => ErrorCode::InvalidRequest,
            AppError::InvalidResource(_) => ErrorCode::InvalidResource,
            AppError::NotFound(_) => ErrorCode::NotFound,
            AppError::Unauthorized => ErrorCode::Unauthorized,
        }
    }

    /// Render as a protocol error frame.
    pub fn frame(&self, id: Option<u64>) -> ServerFrame {
        ServerFrame::error(self.code(), self.public_message(), id)
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Engine(_) | AppError::InvalidRequest(_) | AppError::InvalidResource(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }

    fn public_message(&self) -> String {
        match self {
            // storage internals never leak to the wire
            AppError::Database(error) => {
                tracing::error!(%error, "database error");
                "internal server error".to_string()
            }
            AppError::Internal(error) => {
                tracing::error!(%error, "internal error");
                "internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Error response body: `{ message, code, details? }`.
#[derive(Serialize)]
struct ErrorResponse {
    message: String,
    code: ErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            message: self.public_message(),
            code: self.code(),
            details: None,
        });
        (self.status(), body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
