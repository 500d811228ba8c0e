use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors returned by the file host, mapped to HTTP statuses.
#[derive(Debug, Error)]
pub enum ServerError {
    /// No stored file for this hash.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Upload body exceeds the configured cap.
    #[error("File too large: {size} bytes (max {max})")]
    FileTooLarge { size: usize, max: usize },

    /// Filesystem failure in the file store.
    #[error("File storage error: {0}")]
    Storage(String),

    /// Missing or unknown bearer token.
    #[error("Missing or invalid bearer token")]
    Unauthorized,

    /// Malformed hash or request body.
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// The hash is on the forbidden list.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The endpoint is disabled by configuration.
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::FileNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::FileTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            ServerError::Storage(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "File storage error".to_string())
            }
            ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
