use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors raised while turning a source file and options into an encoder invocation,
/// or while starting a batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Unrecognized option token, out-of-range value or missing encoder executable.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Manual template missing one of the required placeholders.
    #[error("template error: {0}")]
    Template(String),
    #[error("a batch is already running")]
    AlreadyRunning,
}

impl EncodeError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Generic(#[from] anyhow::Error),
    #[error("{0}")]
    Encode(#[from] EncodeError),
    #[error("failed to validate payload: {0}")]
    FailedValidation(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            Self::Generic(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("internal server error: {}", err),
            ),
            Self::Encode(err @ EncodeError::AlreadyRunning) => {
                (StatusCode::CONFLICT, err.to_string())
            }
            Self::Encode(err) => (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
            Self::FailedValidation(reason) => (
                StatusCode::BAD_REQUEST,
                format!("validation failed: {}", reason),
            ),
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}
