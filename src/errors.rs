use crate::services::PhotoError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

/// Map the service-layer failure taxonomy onto HTTP statuses. Not-found is
/// surfaced distinctly from internal failures so clients can tell "index
/// first" apart from "retry later".
impl From<PhotoError> for AppError {
    fn from(err: PhotoError) -> Self {
        let status = match &err {
            PhotoError::Validation(_) => StatusCode::BAD_REQUEST,
            PhotoError::NotFound(_) => StatusCode::NOT_FOUND,
            PhotoError::Conflict(_) => StatusCode::CONFLICT,
            PhotoError::Storage(_) | PhotoError::Persistence(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError::new(status, err.to_string())
    }
}
