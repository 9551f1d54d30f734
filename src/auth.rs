//! Detects expired sessions and triggers a forced credential refresh.

use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::credentials::CredentialStore;
use crate::error::MetaAiError;

/// Lower-case phrases the provider uses when a session is no longer valid.
pub const AUTH_FAILURE_PHRASES: [&str; 6] = [
    "access token required",
    "unauthorized",
    "invalid session",
    "session expired",
    "authentication required",
    "not logged in",
];

/// Whether a provider response signals an auth failure.
pub fn is_auth_failure(status: u16, body: &str) -> bool {
    if status == 403 {
        return true;
    }
    let body = body.to_lowercase();
    AUTH_FAILURE_PHRASES.iter().any(|phrase| body.contains(phrase))
}

/// The part of a successful response that can carry an auth error.
///
/// Successful generation and feed responses echo user prompts, so for JSON bodies only
/// the `error`/`errors`/`message` fields are considered. Bodies without any JSON, such as
/// HTML pages, are returned whole.
pub fn error_surface(body: &str) -> String {
    fn collect(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) => out.push(s.clone()),
            Value::Array(items) => items.iter().for_each(|item| collect(item, out)),
            Value::Object(map) => map.values().for_each(|item| collect(item, out)),
            _ => {}
        }
    }

    let documents: Vec<Value> = match serde_json::from_str::<Value>(body.trim()) {
        Ok(document) => vec![document],
        Err(_) => body
            .lines()
            .map(|line| line.trim().trim_start_matches("data:").trim())
            .filter(|line| line.starts_with('{'))
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect(),
    };
    if documents.is_empty() {
        return body.to_string();
    }

    let mut surface = Vec::new();
    for document in &documents {
        for key in ["error", "errors", "message", "error_description"] {
            if let Some(value) = document.get(key) {
                collect(value, &mut surface);
            }
        }
    }
    surface.join("\n")
}

/// Applied after every provider call.
///
/// On an auth failure it forces a refresh and reports the outcome as an error; it never
/// re-issues the original call.
#[derive(Clone)]
pub struct SessionGuard {
    store: Arc<CredentialStore>,
}

impl SessionGuard {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self { store }
    }

    /// Returns `Ok(())` when the response is not an auth failure.
    ///
    /// # Errors
    ///
    /// - `MetaAiError::SessionExpired` if a failure was detected and the refresh worked.
    /// - `MetaAiError::AuthRefreshFailed` if the refresh failed as well.
    pub async fn check(&self, status: u16, body: &str) -> Result<(), MetaAiError> {
        let detected = if (200..300).contains(&status) {
            is_auth_failure(status, &error_surface(body))
        } else {
            is_auth_failure(status, body)
        };
        if !detected {
            return Ok(());
        }
        warn!(status, "auth failure detected, forcing credential refresh");
        match self.store.refresh(true).await {
            Ok(_) => {
                info!("credentials refreshed after auth failure");
                Err(MetaAiError::SessionExpired)
            }
            Err(err) => Err(MetaAiError::AuthRefreshFailed {
                reason: err.to_string(),
            }),
        }
    }
}
