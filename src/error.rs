use crate::decode::DecodeFailure;

/// The primary error type for the Meta AI client.
///
/// This enum consolidates all possible errors that can occur while talking to the
/// provider, from configuration problems to session expiry and upload rejections.
#[derive(Debug, thiserror::Error)]
pub enum MetaAiError {
    /// Mandatory session cookies were neither passed in nor found in the environment.
    #[error("Missing mandatory credentials: {}. Provide them explicitly or set META_AI_DATR / META_AI_ABRA_SESS.", missing.join(", "))]
    MissingCredentials { missing: Vec<&'static str> },

    /// The request was rejected locally before anything was sent.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Error originating from the underlying HTTP client (`reqwest`).
    #[error("Network request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// Error during JSON serialization or deserialization.
    #[error("Failed to parse API response: {0}")]
    ResponseParseFailed(#[from] serde_json::Error),

    /// The provider answered, but not with anything we could use.
    #[error("Failed to decode provider response: {0}")]
    Decode(#[from] DecodeFailure),

    /// A non-success status from an endpoint that has no richer decoding.
    #[error("API request failed with status {status}: {message}")]
    ApiError { status: u16, message: String },

    /// An auth failure was detected and the forced refresh succeeded.
    /// The original call was not retried; the caller decides whether to do so.
    #[error("Session expired; credentials were refreshed and the request may be retried")]
    SessionExpired,

    /// An auth failure was detected and the forced refresh failed too.
    #[error("Authentication failed and credential refresh did not recover: {reason}")]
    AuthRefreshFailed { reason: String },

    /// A forced credential refresh failed.
    #[error("Credential refresh failed: {0}")]
    RefreshFailed(String),

    /// Upload needs the derived bearer token and none is available.
    #[error("No access token available for upload. Refresh credentials first.")]
    MissingBearerToken,

    /// Only images can be uploaded.
    #[error("Unsupported media type for upload: {0}")]
    InvalidMediaType(String),

    /// The upload service rejected the file.
    #[error("Upload rejected ({error_type}): {message}")]
    UploadRejected {
        error_type: String,
        message: String,
        retriable: bool,
    },

    /// Error related to URL parsing.
    #[error("URL parsing failed: {0}")]
    UrlParseFailed(#[from] url::ParseError),

    /// Error related to file input/output operations.
    #[error("File I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl MetaAiError {
    /// Whether a retry of the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            MetaAiError::RequestFailed(_) | MetaAiError::SessionExpired => true,
            MetaAiError::Decode(failure) => failure.is_retryable(),
            MetaAiError::ApiError { status, .. } => *status == 429 || *status >= 500,
            MetaAiError::UploadRejected { retriable, .. } => *retriable,
            _ => false,
        }
    }

    /// Errors that stop a polling loop instead of counting as "not ready yet".
    pub(crate) fn is_fatal_for_polling(&self) -> bool {
        matches!(
            self,
            MetaAiError::AuthRefreshFailed { .. } | MetaAiError::MissingCredentials { .. }
        )
    }
}
