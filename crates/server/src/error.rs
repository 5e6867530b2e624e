// crates/server/src/error.rs
use axum::{
    extract::multipart::{MultipartError, MultipartRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use iavatar_core::{MediaError, StagingError};
use iavatar_server_jobs::RegistryError;
use iavatar_types::{ErrorKind, JobError, OptionError};
use serde::Serialize;
use thiserror::Error;

/// Structured JSON error body: `{error_kind, message}`.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ErrorResponse {
    pub error_kind: ErrorKind,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error_kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error_kind,
            message: message.into(),
        }
    }
}

/// API error types that map to HTTP status codes
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{field} exceeds the {limit}-byte upload limit")]
    PayloadTooLarge { field: String, limit: usize },

    #[error("Request body exceeds the upload limit")]
    BodyTooLarge,

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// A job ran and failed; its recorded error is returned as-is.
    #[error("Job failed: {0}")]
    JobFailed(JobError),

    #[error("Staging error: {0}")]
    Staging(#[from] StagingError),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Validation(_)
            | ApiError::PayloadTooLarge { .. }
            | ApiError::BodyTooLarge => ErrorKind::ValidationError,
            ApiError::JobNotFound(_) => ErrorKind::NotFoundError,
            ApiError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            ApiError::JobFailed(e) => e.error_kind,
            ApiError::Staging(_) | ApiError::Internal(_) => ErrorKind::InternalError,
        }
    }
}

/// HTTP status for each error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
        ErrorKind::InputDecodeError => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::ResourceExhaustedError | ErrorKind::ServiceUnavailable => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::PipelineError
        | ErrorKind::InvalidTransitionError
        | ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::TimeoutError => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::NotFoundError => StatusCode::NOT_FOUND,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let (status, message) = match &self {
            ApiError::Validation(msg) => {
                tracing::warn!(message = %msg, "Rejected request");
                (StatusCode::BAD_REQUEST, msg.clone())
            }
            ApiError::PayloadTooLarge { field, limit } => {
                tracing::warn!(field = %field, limit, "Upload too large");
                (StatusCode::PAYLOAD_TOO_LARGE, self.to_string())
            }
            ApiError::BodyTooLarge => {
                tracing::warn!("Request body too large");
                (StatusCode::PAYLOAD_TOO_LARGE, self.to_string())
            }
            ApiError::JobNotFound(id) => {
                tracing::debug!(job_id = %id, "Job not found");
                (StatusCode::NOT_FOUND, format!("Job not found: {id}"))
            }
            ApiError::ServiceUnavailable(msg) => {
                tracing::warn!(message = %msg, "Service unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, msg.clone())
            }
            ApiError::JobFailed(error) if error.error_kind == ErrorKind::InternalError => {
                tracing::error!(message = %error.message, "Job failed internally");
                (status_for(kind), "Internal server error".to_string())
            }
            ApiError::JobFailed(error) => {
                tracing::warn!(error_kind = %error.error_kind, message = %error.message, "Job failed");
                (status_for(kind), error.message.clone())
            }
            ApiError::Staging(err) => {
                tracing::error!(error = %err, "Staging error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::Internal(msg) => {
                tracing::error!(message = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(ErrorResponse::new(kind, message))).into_response()
    }
}

impl From<MediaError> for ApiError {
    fn from(err: MediaError) -> Self {
        ApiError::Validation(err.to_string())
    }
}

impl From<OptionError> for ApiError {
    fn from(err: OptionError) -> Self {
        ApiError::Validation(err.to_string())
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => ApiError::JobNotFound(id.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::BodyTooLarge
        } else {
            ApiError::Validation(format!("Malformed multipart body: {}", err.body_text()))
        }
    }
}

/// The request was not `multipart/form-data` at all.
impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        ApiError::Validation(format!("Expected a multipart upload: {}", rejection.body_text()))
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
