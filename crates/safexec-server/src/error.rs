//! Error types for the HTTP layer.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use safexec_core::{DispatchError, HistoryError};
use serde_json::json;
use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors raised before a request reaches the dispatcher, or while serving.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Required request field absent
    #[error("Missing '{0}' field")]
    MissingField(String),

    /// Malformed request body
    #[error("{0}")]
    InvalidRequest(String),

    /// History store could not be read
    #[error("History unavailable: {0}")]
    History(#[from] HistoryError),

    /// Dispatcher could not be built
    #[error("Dispatcher error: {0}")]
    Dispatch(#[from] DispatchError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Server configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField(field.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::MissingField(_) | ServerError::InvalidRequest(_) => 400,
            ServerError::History(_)
            | ServerError::Dispatch(_)
            | ServerError::Io(_)
            | ServerError::Config(_)
            | ServerError::Internal(_) => 500,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ServerError::MissingField(_) => "missing_field",
            ServerError::InvalidRequest(_) => "invalid_request",
            ServerError::History(_) => "history_error",
            ServerError::Dispatch(_) => "dispatch_error",
            ServerError::Io(_) => "io_error",
            ServerError::Config(_) => "config_error",
            ServerError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            log::error!("{} ({})", self, self.error_type());
        } else {
            log::debug!("Rejected request: {} ({})", self, self.error_type());
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
