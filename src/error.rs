use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;

use crate::repo::RepoError;

/// JSON error body: every failure renders as `{error, message}`.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: String,
    pub message: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    /// Required request field absent or malformed.
    #[error("{0}")]
    Validation(String),
    #[error("File size exceeds the maximum allowed limit")]
    FileTooLarge,
    #[error("Only image, video, and audio files are allowed")]
    InvalidFileType,
    #[error("Query parameter \"q\" is required")]
    MissingQuery,
    #[error("not found")]
    NotFound,
    /// Repost target missing; surfaces as its own 404 message.
    #[error("Original post not found")]
    OriginalNotFound,
    #[error("Resource already exists")]
    Conflict,
    /// Foreign-key violation: the referenced entity vanished. Reported as
    /// 404 since the caller named something that does not exist.
    #[error("Referenced resource does not exist")]
    Referential,
    #[error("Something went wrong")]
    Internal,
}

impl From<RepoError> for ApiError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::NotFound => ApiError::NotFound,
            RepoError::Conflict => ApiError::Conflict,
            RepoError::ForeignKey => ApiError::Referential,
            RepoError::Internal(msg) => {
                log::error!("repository error: {msg}");
                ApiError::Internal
            }
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            ApiError::Validation(_)
            | ApiError::FileTooLarge
            | ApiError::InvalidFileType
            | ApiError::MissingQuery => StatusCode::BAD_REQUEST,
            ApiError::NotFound | ApiError::OriginalNotFound | ApiError::Referential => {
                StatusCode::NOT_FOUND
            }
            ApiError::Conflict => StatusCode::CONFLICT,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let error = match self {
            ApiError::Validation(_) => "Missing required fields",
            ApiError::FileTooLarge => "File too large",
            ApiError::InvalidFileType => "Invalid file type",
            ApiError::MissingQuery => "Missing search query",
            ApiError::NotFound => "Not found",
            ApiError::OriginalNotFound => "Original post not found",
            ApiError::Conflict => "Duplicate entry",
            ApiError::Referential => "Resource not found",
            ApiError::Internal => "Internal Server Error",
        };
        HttpResponse::build(self.status_code()).json(ApiErrorBody {
            error: error.to_string(),
            message: self.to_string(),
        })
    }
}
