//! Error types for the sync-trigger API.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response}
};
use errors::{JobError, StorageError};
use serde::Serialize;
use thiserror::Error;

/// Result type alias for API handlers.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Errors returned to administrative callers.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Body missing, malformed, or carrying unknown fields.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Connection {id} not found")]
    ConnectionNotFound { id: i32 },

    #[error("Repo {id} not found")]
    RepoNotFound { id: i32 },

    #[error("Account {id} not found")]
    AccountNotFound { id: String },

    /// Database connection or query error.
    #[error("Database error: {0}")]
    Database(#[from] StorageError),

    /// Job could not be handed to the queue backend.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Internal error for unexpected conditions.
    #[error("Internal error: {0}")]
    Internal(String)
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Storage(e) => Self::Database(e),
            JobError::Queue(e) => Self::Queue(e.to_string()),
            other => Self::Internal(other.to_string())
        }
    }
}

/// Error response body for HTTP endpoints.
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>
}

impl ApiError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::ConnectionNotFound { .. } => "CONNECTION_NOT_FOUND",
            Self::RepoNotFound { .. } => "REPO_NOT_FOUND",
            Self::AccountNotFound { .. } => "ACCOUNT_NOT_FOUND",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Queue(_) => "QUEUE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR"
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::ConnectionNotFound { .. } | Self::RepoNotFound { .. } | Self::AccountNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            Self::Database(_) | Self::Queue(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (message, details) = match &self {
            Self::InvalidRequest(reason) => ("Invalid request body".to_string(), Some(reason.clone())),
            Self::ConnectionNotFound { .. } | Self::RepoNotFound { .. } | Self::AccountNotFound { .. } => {
                (self.to_string(), None)
            }
            Self::Database(e) => {
                tracing::error!(error = %e, "Database error");
                ("A database error occurred".to_string(), None)
            }
            Self::Queue(reason) => {
                tracing::error!(error = %reason, "Queue error");
                ("Failed to enqueue job".to_string(), Some(reason.clone()))
            }
            Self::Internal(msg) => {
                tracing::error!(message = %msg, "Internal error");
                ("An internal error occurred".to_string(), Some(msg.clone()))
            }
        };

        let body = ErrorResponse {
            error: message,
            code: self.code().to_string(),
            details
        };

        (self.status(), Json(body)).into_response()
    }
}
