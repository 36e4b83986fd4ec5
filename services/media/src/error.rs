use crate::cache::CacheError;
use crate::media_store::StoreError;
use crate::normalizer::ProcessingError;
use crate::reference_store::ReferenceError;
use crate::validation::ValidationError;
use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Errors surfaced by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Reference(#[from] ReferenceError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Invalid upload: {}", .0.body_text())]
    Multipart(#[from] MultipartError),

    #[error("{0}")]
    InvalidInput(String),

    #[error("Missing or invalid admin token")]
    Unauthorized,

    #[error("Admin access is not configured")]
    Forbidden,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Store(e) => match e {
                StoreError::Validation(ValidationError::FileTooLarge { .. }) => {
                    (StatusCode::BAD_REQUEST, "FILE_TOO_LARGE")
                }
                StoreError::Validation(_) => (StatusCode::BAD_REQUEST, "INVALID_FILE"),
                StoreError::TooManyFiles { .. } => (StatusCode::BAD_REQUEST, "TOO_MANY_FILES"),
                StoreError::Processing(ProcessingError::Decode(_)) => {
                    (StatusCode::BAD_REQUEST, "INVALID_IMAGE")
                }
                StoreError::Processing(ProcessingError::Encode(_)) | StoreError::Task(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "PROCESSING_ERROR")
                }
                StoreError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
            },
            ApiError::Reference(e) => match e {
                ReferenceError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                ReferenceError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
                ReferenceError::Database(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR")
                }
            },
            ApiError::Cache(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CACHE_ERROR"),
            ApiError::Multipart(e) => match e.status() {
                StatusCode::PAYLOAD_TOO_LARGE => (StatusCode::PAYLOAD_TOO_LARGE, "UPLOAD_TOO_LARGE"),
                status if status.is_client_error() => (status, "INVALID_UPLOAD"),
                status => (status, "UPLOAD_READ_ERROR"),
            },
            ApiError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        // Server-side failures keep their details in the log
        let message = if status.is_server_error() {
            error!(error = %self, code, "Request failed");
            match code {
                "STORAGE_ERROR" => "Failed to save file".to_string(),
                "PROCESSING_ERROR" => "Image processing failed".to_string(),
                _ => "Internal server error".to_string(),
            }
        } else {
            self.to_string()
        };

        (
            status,
            Json(ErrorResponse {
                error: message,
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn status(err: impl Into<ApiError>) -> StatusCode {
        err.into().into_response().status()
    }

    #[test]
    fn test_client_errors_are_4xx() {
        assert_eq!(
            status(StoreError::from(ValidationError::MissingFilename)),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(StoreError::TooManyFiles { count: 6, max: 5 }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(StoreError::from(ProcessingError::Decode("bad".into()))),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(ReferenceError::NotFound { entity: "Tag", id: 1 }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(ReferenceError::Conflict("dup".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(status(ApiError::Unauthorized), StatusCode::UNAUTHORIZED);
        assert_eq!(status(ApiError::Forbidden), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_server_errors_are_5xx() {
        assert_eq!(
            status(StoreError::from(io::Error::new(io::ErrorKind::Other, "disk"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status(StoreError::from(ProcessingError::Encode("codec".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status(ReferenceError::Database(sqlx::Error::PoolTimedOut)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(status(CacheError::Poisoned), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
