//! Error types for the gateway core.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Error taxonomy surfaced by the core services.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    #[error("Backend startup timeout: {0}")]
    BackendStartupTimeout(String),

    #[error("Backend load failed: {0}")]
    BackendLoadFailed(String),

    #[error("Model not found: {0}")]
    NotFound(String),

    #[error("Queue is full: {0}")]
    QueueFull(String),

    #[error("Backend communication error: {0}")]
    Communication(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable tag for the HTTP surface and job records.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidConfig(_) => "invalid_config",
            Error::Parse(_) => "parse_error",
            Error::Io(_) => "io_error",
            Error::BackendNotFound(_) => "backend_not_found",
            Error::BackendStartupTimeout(_) => "backend_startup_timeout",
            Error::BackendLoadFailed(_) => "backend_load_failed",
            Error::NotFound(_) => "not_found",
            Error::QueueFull(_) => "queue_full",
            Error::Communication(_) => "communication_error",
            Error::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::InvalidConfig(_) | Error::Parse(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) | Error::BackendNotFound(_) => StatusCode::NOT_FOUND,
            Error::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Communication(_) => StatusCode::BAD_GATEWAY,
            Error::BackendStartupTimeout(_)
            | Error::BackendLoadFailed(_)
            | Error::Io(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Communication(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
