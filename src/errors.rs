use crate::services::repository::RepositoryError;
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

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
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

impl From<RepositoryError> for AppError {
    fn from(err: RepositoryError) -> Self {
        let status = match &err {
            RepositoryError::NotFound(_) => StatusCode::NOT_FOUND,
            RepositoryError::InvalidRecord(_) => StatusCode::BAD_REQUEST,
            RepositoryError::AlreadyExists(_) => StatusCode::CONFLICT,
            e if e.is_storage_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "repository operation failed");
        }
        AppError::new(status, err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_errors_map_to_status() {
        let cases = [
            (RepositoryError::bundle_not_found("x"), StatusCode::NOT_FOUND),
            (RepositoryError::InvalidRecord("bad".into()), StatusCode::BAD_REQUEST),
            (RepositoryError::AlreadyExists("u1".into()), StatusCode::CONFLICT),
            (
                RepositoryError::Io(std::io::Error::other("disk gone")),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                RepositoryError::corrupt("u1", "bad json"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(AppError::from(err).status, expected);
        }
    }
}
