//! Error responses of the HTTP front-end.
//!
//! Every failure is answered with `{success: false, error, detail}`; upload failures
//! also carry `error_type` and `retriable`.

use axum::{
    extract::{multipart::MultipartRejection, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

use crate::error::MetaAiError;
use crate::jobs::JobError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{what} timeout")]
    Timeout { what: &'static str, limit: Duration, hint: &'static str },

    #[error("{message}")]
    GenerationFailed { message: String, detail: String },

    #[error("Job not found")]
    JobNotFound(#[from] JobError),

    #[error("{0}")]
    Upload(MetaAiError),
}

impl ApiError {
    /// Maps a client error raised while generating `what` ("Image", "Video").
    pub fn generation(what: &str, err: MetaAiError) -> Self {
        match err {
            MetaAiError::InvalidRequest(message) => ApiError::BadRequest(message),
            other => ApiError::GenerationFailed {
                message: other.to_string(),
                detail: format!("{what} generation failed"),
            },
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retriable: Option<bool>,
}

impl ErrorResponse {
    fn new(error: String, detail: impl Into<String>) -> Self {
        Self {
            success: false,
            error,
            detail: detail.into(),
            error_type: None,
            retriable: None,
        }
    }
}

fn upload_failure(err: &MetaAiError) -> (StatusCode, ErrorResponse) {
    let (status, error_type, retriable) = match err {
        MetaAiError::MissingBearerToken => (StatusCode::UNAUTHORIZED, "missing_token", false),
        MetaAiError::InvalidMediaType(_) => {
            (StatusCode::UNSUPPORTED_MEDIA_TYPE, "invalid_type", false)
        }
        MetaAiError::UploadRejected { retriable, .. } => {
            (StatusCode::BAD_GATEWAY, "rejected", *retriable)
        }
        MetaAiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request", false),
        other => (StatusCode::INTERNAL_SERVER_ERROR, "rejected", other.is_transient()),
    };
    let mut body = ErrorResponse::new(err.to_string(), "Image upload failed");
    body.error_type = Some(error_type.to_string());
    body.retriable = Some(retriable);
    (status, body)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new(message.clone(), "Invalid request"),
            ),
            ApiError::Timeout { limit, hint, .. } => (
                StatusCode::GATEWAY_TIMEOUT,
                ErrorResponse::new(
                    self.to_string(),
                    format!("Request exceeded {} second timeout. {hint}", limit.as_secs()),
                ),
            ),
            ApiError::GenerationFailed { message, detail } => {
                error!(%message, "generation failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new(message.clone(), detail.clone()),
                )
            }
            ApiError::JobNotFound(_) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::new(self.to_string(), "Job not found"),
            ),
            ApiError::Upload(err) => {
                error!(error = %err, "upload failed");
                upload_failure(err)
            }
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_requests_map_to_bad_request() {
        let err = ApiError::generation(
            "Image",
            MetaAiError::InvalidRequest("prompt must not be empty".into()),
        );
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn provider_failures_map_to_internal_error() {
        let err = ApiError::generation("Video", MetaAiError::SessionExpired);
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn upload_failures_are_classified() {
        let (status, body) = upload_failure(&MetaAiError::MissingBearerToken);
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.error_type.as_deref(), Some("missing_token"));

        let (_, body) = upload_failure(&MetaAiError::InvalidMediaType("text/plain".into()));
        assert_eq!(body.error_type.as_deref(), Some("invalid_type"));
        assert_eq!(body.retriable, Some(false));

        let (status, body) = upload_failure(&MetaAiError::UploadRejected {
            error_type: "AuthorizationFailedError".into(),
            message: "expired".into(),
            retriable: true,
        });
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body.error_type.as_deref(), Some("rejected"));
        assert_eq!(body.retriable, Some(true));
    }

    #[test]
    fn timeouts_report_the_limit() {
        let err = ApiError::Timeout {
            what: "Image generation",
            limit: Duration::from_secs(120),
            hint: "The generation may still be processing.",
        };
        assert_eq!(err.to_string(), "Image generation timeout");
        assert_eq!(err.into_response().status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
