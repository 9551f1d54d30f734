//! Server configuration, loaded from environment variables.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Settings of the HTTP front-end. Cookies are read separately by the client.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,

    /// Upper bound for synchronous generation requests
    pub request_timeout: Duration,
    /// Period of the background credential refresh
    pub refresh_interval: Duration,

    /// Allowed CORS origins; empty means any
    pub cors_allowed_origins: Vec<String>,

    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,

    /// Overrides for the provider endpoints
    pub base_url: Option<String>,
    pub upload_url: Option<String>,

    /// Where refreshed credentials are persisted
    pub credentials_cache: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            request_timeout: Duration::from_secs(120),
            refresh_interval: Duration::from_secs(3600),
            cors_allowed_origins: Vec::new(),
            http_proxy: None,
            https_proxy: None,
            base_url: None,
            upload_url: None,
            credentials_cache: None,
        }
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty() && *origin != "*")
        .map(str::to_string)
        .collect()
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env::var("META_AI_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("META_AI_PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .context("Invalid META_AI_PORT")?,

            request_timeout: Duration::from_secs(
                env::var("META_AI_REQUEST_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "120".to_string())
                    .parse()
                    .context("Invalid META_AI_REQUEST_TIMEOUT_SECONDS")?,
            ),
            refresh_interval: Duration::from_secs(
                env::var("META_AI_REFRESH_INTERVAL_SECONDS")
                    .unwrap_or_else(|_| "3600".to_string())
                    .parse()
                    .context("Invalid META_AI_REFRESH_INTERVAL_SECONDS")?,
            ),

            cors_allowed_origins: non_empty("META_AI_CORS_ALLOWED_ORIGINS")
                .map(|raw| parse_origins(&raw))
                .unwrap_or_default(),

            http_proxy: non_empty("META_AI_PROXY_HTTP"),
            https_proxy: non_empty("META_AI_PROXY_HTTPS"),

            base_url: non_empty("META_AI_BASE_URL"),
            upload_url: non_empty("META_AI_UPLOAD_URL"),

            credentials_cache: non_empty("META_AI_CREDENTIALS_CACHE").map(PathBuf::from),
        })
    }
}
