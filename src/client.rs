use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, COOKIE, USER_AGENT};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::auth::SessionGuard;
use crate::credentials::{
    scrape_landing_cookies, CredentialStore, Credentials, DEFAULT_REFRESH_INTERVAL,
};
use crate::decode::decode;
use crate::error::MetaAiError;
use crate::request::{
    build_generation, build_media_fetch, conversation_url, ClientProfile, DEFAULT_BASE_URL,
};
use crate::resolve::{resolve_media, MediaSource, ResolutionPolicy};
use crate::types::{
    GenerationKind, GenerationRequest, GenerationResult, MediaKind, MediaPlaceholder, Orientation,
    ResolutionStrategy,
};
use crate::upload::UploadPolicy;

pub const DEFAULT_UPLOAD_URL: &str = "https://rupload.meta.ai/";

/// The main client for generating media through Meta AI.
///
/// It holds the shared `reqwest::Client`, the credential store and the resolution
/// policies. It is cheap to clone and safe to share across tasks.
#[derive(Clone)]
pub struct MetaAiClient {
    pub(crate) client: reqwest::Client,
    pub(crate) base_url: Url,
    pub(crate) upload_url: Url,
    pub(crate) profile: ClientProfile,
    pub(crate) credentials: Arc<CredentialStore>,
    pub(crate) guard: SessionGuard,
    image_policy: ResolutionPolicy,
    video_policy: ResolutionPolicy,
    pub(crate) upload_policy: UploadPolicy,
}

impl MetaAiClient {
    /// Creates a new `MetaAiClient`.
    ///
    /// Explicit credentials take precedence; any cookie they lack is read from the
    /// `META_AI_*` environment variables.
    ///
    /// # Errors
    ///
    /// - `MetaAiError::MissingCredentials` if `datr` or `abra_sess` is still missing. No
    ///   network call is made in that case.
    /// - `MetaAiError::RequestFailed` if the internal HTTP client fails to build.
    pub fn new(credentials: Option<Credentials>) -> Result<Self, MetaAiError> {
        let mut builder = Self::builder().from_env(true);
        if let Some(credentials) = credentials {
            builder = builder.credentials(credentials);
        }
        builder.build()
    }

    /// Creates a new `MetaAiClient` talking to a custom base URL.
    ///
    /// The upload endpoint is assumed to live under the same URL. This is useful for
    /// testing against a mock server. The environment is not consulted.
    pub fn new_with_url(credentials: Credentials, base_url: &str) -> Result<Self, MetaAiError> {
        Self::builder()
            .credentials(credentials)
            .base_url(base_url)
            .upload_url(base_url)
            .build()
    }

    pub fn builder() -> MetaAiClientBuilder {
        MetaAiClientBuilder::default()
    }

    /// The shared credential store.
    pub fn credentials(&self) -> Arc<CredentialStore> {
        Arc::clone(&self.credentials)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The resolution bounds `generate` uses for `kind`.
    pub fn policy_for(&self, kind: GenerationKind) -> ResolutionPolicy {
        match kind {
            GenerationKind::Video => self.video_policy,
            _ => self.image_policy,
        }
    }

    /// Generates images from a text prompt.
    pub async fn generate_image(
        &self,
        prompt: &str,
        orientation: Orientation,
    ) -> Result<GenerationResult, MetaAiError> {
        self.generate(&GenerationRequest::image(prompt).with_orientation(orientation))
            .await
    }

    /// Generates a video from a text prompt.
    pub async fn generate_video(&self, prompt: &str) -> Result<GenerationResult, MetaAiError> {
        self.generate(&GenerationRequest::video(prompt)).await
    }

    /// Sends a plain text prompt and returns the assistant's reply in
    /// [`GenerationResult::text`].
    pub async fn prompt_text(&self, message: &str) -> Result<GenerationResult, MetaAiError> {
        self.generate(&GenerationRequest::text(message)).await
    }

    /// Runs one generation request end to end.
    ///
    /// Submits the request, decodes whichever transport the provider answers with and
    /// resolves media placeholders until their URLs are known or the policy for the kind
    /// runs out. Retrying is left to the caller; the request's correlation ids make a
    /// retry of the same request recognisable to the provider.
    ///
    /// # Errors
    ///
    /// - `MetaAiError::InvalidRequest` for an empty prompt, before anything is sent.
    /// - `MetaAiError::SessionExpired` / `MetaAiError::AuthRefreshFailed` on auth failures.
    /// - `MetaAiError::RequestFailed` / `MetaAiError::Decode` on transport problems.
    ///
    /// An empty media list is not an error: it comes back with `success == false`.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, MetaAiError> {
        self.generate_with_policy(request, &self.policy_for(request.kind))
            .await
    }

    /// Like [`MetaAiClient::generate`], with explicit resolution bounds.
    #[instrument(
        skip(self, request, policy),
        fields(kind = ?request.kind, conversation_id = %request.correlation.conversation_id)
    )]
    pub async fn generate_with_policy(
        &self,
        request: &GenerationRequest,
        policy: &ResolutionPolicy,
    ) -> Result<GenerationResult, MetaAiError> {
        request.validate()?;
        let credentials = self.credentials.snapshot().await;
        let call = build_generation(request, &credentials, &self.profile, &self.base_url)?;
        info!(
            doc_id = call.doc_id,
            operation = call.friendly_name,
            "submitting generation request"
        );

        let response = call.into_builder(&self.client).send().await?;
        let (status, content_type, body) = read_response(response).await?;
        self.guard.check(status, &body).await?;
        let decoded = decode(status, content_type.as_deref(), &body)?;
        debug!(
            transport = ?decoded.transport,
            placeholders = decoded.placeholders.len(),
            strategy = ?decoded.strategy,
            "generation response decoded"
        );

        let conversation_id = decoded
            .conversation_id
            .clone()
            .unwrap_or_else(|| request.correlation.conversation_id.clone());

        let Some(kind) = request.kind.media_kind() else {
            let success = decoded.text.as_deref().is_some_and(|t| !t.trim().is_empty());
            return Ok(GenerationResult {
                success,
                prompt: request.prompt.clone(),
                kind: request.kind,
                conversation_id,
                media: Vec::new(),
                text: decoded.text,
                strategy: ResolutionStrategy::None,
                attempts: 0,
                error: (!success).then(|| "The assistant returned no text".to_string()),
            });
        };

        let outcome = resolve_media(self, &decoded, kind, &conversation_id, policy).await?;
        let success = !outcome.items.is_empty();
        if success {
            info!(
                media = outcome.items.len(),
                strategy = ?outcome.strategy,
                "generation succeeded"
            );
        } else {
            warn!(attempts = outcome.attempts, "generation finished without any media url");
        }

        Ok(GenerationResult {
            success,
            prompt: request.prompt.clone(),
            kind: request.kind,
            conversation_id,
            media: outcome.items,
            text: decoded.text,
            strategy: outcome.strategy,
            attempts: outcome.attempts,
            error: (!success).then(|| {
                let noun = match kind {
                    MediaKind::Image => "image",
                    MediaKind::Video => "video",
                };
                format!(
                    "Generation completed but no {noun} URLs were found after {} attempts",
                    outcome.attempts
                )
            }),
        })
    }

    /// Forces a credential refresh.
    pub async fn refresh_credentials(&self) -> Result<bool, MetaAiError> {
        self.credentials.refresh(true).await
    }

    fn page_headers(&self, credentials: &Credentials) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&self.profile.user_agent) {
            headers.insert(USER_AGENT, value);
        }
        if let Ok(value) = HeaderValue::from_str(&credentials.cookie_header()) {
            headers.insert(COOKIE, value);
        }
        headers
    }
}

pub(crate) async fn read_response(
    response: reqwest::Response,
) -> Result<(u16, Option<String>, String), MetaAiError> {
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = response.text().await?;
    Ok((status, content_type, body))
}

#[async_trait]
impl MediaSource for MetaAiClient {
    #[instrument(skip(self))]
    async fn fetch_media(
        &self,
        media_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<MediaPlaceholder>, MetaAiError> {
        let credentials = self.credentials.snapshot().await;
        let call = build_media_fetch(
            media_id,
            conversation_id,
            &credentials,
            &self.profile,
            &self.base_url,
        )?;
        let response = call.into_builder(&self.client).send().await?;
        let (status, content_type, body) = read_response(response).await?;
        self.guard.check(status, &body).await?;
        let decoded = decode(status, content_type.as_deref(), &body)?;
        Ok(decoded.placeholders)
    }

    #[instrument(skip(self))]
    async fn fetch_conversation_page(&self, conversation_id: &str) -> Result<String, MetaAiError> {
        let credentials = self.credentials.snapshot().await;
        let url = conversation_url(&self.base_url, conversation_id)?;
        let response = self
            .client
            .get(url)
            .headers(self.page_headers(&credentials))
            .send()
            .await?;
        let (status, _, body) = read_response(response).await?;
        self.guard.check(status, &body).await?;
        if !(200..300).contains(&status) {
            return Err(MetaAiError::ApiError {
                status,
                message: "conversation page request failed".into(),
            });
        }
        Ok(body)
    }
}

/// Configures and builds a [`MetaAiClient`].
pub struct MetaAiClientBuilder {
    credentials: Option<Credentials>,
    from_env: bool,
    base_url: String,
    upload_url: String,
    profile: ClientProfile,
    http_proxy: Option<String>,
    https_proxy: Option<String>,
    request_timeout: Option<Duration>,
    refresh_interval: Duration,
    cache_path: Option<PathBuf>,
    image_policy: ResolutionPolicy,
    video_policy: ResolutionPolicy,
    upload_policy: UploadPolicy,
}

impl Default for MetaAiClientBuilder {
    fn default() -> Self {
        Self {
            credentials: None,
            from_env: false,
            base_url: DEFAULT_BASE_URL.to_string(),
            upload_url: DEFAULT_UPLOAD_URL.to_string(),
            profile: ClientProfile::default(),
            http_proxy: None,
            https_proxy: None,
            request_timeout: None,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            cache_path: None,
            image_policy: ResolutionPolicy::image_default(),
            video_policy: ResolutionPolicy::video_default(),
            upload_policy: UploadPolicy::default(),
        }
    }
}

impl MetaAiClientBuilder {
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Fill cookies missing from the explicit credentials from `META_AI_*` variables.
    pub fn from_env(mut self, enabled: bool) -> Self {
        self.from_env = enabled;
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn upload_url(mut self, url: impl Into<String>) -> Self {
        self.upload_url = url.into();
        self
    }

    pub fn profile(mut self, profile: ClientProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn http_proxy(mut self, proxy: Option<String>) -> Self {
        self.http_proxy = proxy;
        self
    }

    pub fn https_proxy(mut self, proxy: Option<String>) -> Self {
        self.https_proxy = proxy;
        self
    }

    /// Per-request timeout of the underlying HTTP client.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Minimum time between two non-forced credential refreshes.
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn cache_path(mut self, path: Option<PathBuf>) -> Self {
        self.cache_path = path;
        self
    }

    pub fn image_policy(mut self, policy: ResolutionPolicy) -> Self {
        self.image_policy = policy;
        self
    }

    pub fn video_policy(mut self, policy: ResolutionPolicy) -> Self {
        self.video_policy = policy;
        self
    }

    pub fn upload_policy(mut self, policy: UploadPolicy) -> Self {
        self.upload_policy = policy;
        self
    }

    fn resolved_credentials(&mut self) -> Credentials {
        let explicit = self.credentials.take();
        if self.from_env {
            Credentials::resolve(explicit, |key| env::var(key).ok())
        } else {
            explicit.unwrap_or_default()
        }
    }

    fn http_client(&self) -> Result<reqwest::Client, MetaAiError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = self.request_timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(proxy) = &self.http_proxy {
            builder = builder.proxy(reqwest::Proxy::http(proxy)?);
        }
        if let Some(proxy) = &self.https_proxy {
            builder = builder.proxy(reqwest::Proxy::https(proxy)?);
        }
        Ok(builder.build()?)
    }

    /// Builds the client without touching the network.
    ///
    /// # Errors
    ///
    /// - `MetaAiError::MissingCredentials` if the mandatory cookies are missing.
    /// - `MetaAiError::UrlParseFailed` for an invalid base or upload URL.
    pub fn build(mut self) -> Result<MetaAiClient, MetaAiError> {
        let credentials = self.resolved_credentials();
        credentials.validate()?;
        self.finish(credentials)
    }

    /// Like [`MetaAiClientBuilder::build`], but scrapes the public landing page for
    /// cookies that neither the explicit credentials nor the environment provide.
    pub async fn build_with_page_fallback(mut self) -> Result<MetaAiClient, MetaAiError> {
        let mut credentials = self.resolved_credentials();
        if !credentials.missing_mandatory().is_empty() {
            let http = self.http_client()?;
            let base_url = Url::parse(&self.base_url)?;
            info!("mandatory cookies missing, scraping landing page");
            credentials =
                scrape_landing_cookies(&http, &base_url, &self.profile.user_agent, credentials)
                    .await?;
        }
        credentials.validate()?;
        self.finish(credentials)
    }

    fn finish(self, credentials: Credentials) -> Result<MetaAiClient, MetaAiError> {
        let client = self.http_client()?;
        let base_url = Url::parse(&self.base_url)?;
        let upload_url = Url::parse(&self.upload_url)?;
        let store = CredentialStore::new(
            client.clone(),
            base_url.clone(),
            self.profile.user_agent.clone(),
            credentials,
        )?
        .with_refresh_interval(self.refresh_interval)
        .with_cache_path(self.cache_path);
        let credentials = Arc::new(store);

        Ok(MetaAiClient {
            client,
            base_url,
            upload_url,
            profile: self.profile,
            guard: SessionGuard::new(Arc::clone(&credentials)),
            credentials,
            image_policy: self.image_policy,
            video_policy: self.video_policy,
            upload_policy: self.upload_policy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credentials_fail_before_any_network_call() {
        let result = MetaAiClient::builder()
            .base_url("http://127.0.0.1:9/")
            .credentials(Credentials::new().with_cookie("datr", "only-datr"))
            .build();
        match result {
            Err(MetaAiError::MissingCredentials { missing }) => {
                assert_eq!(missing, vec!["abra_sess"])
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("client built without abra_sess"),
        }
    }

    #[test]
    fn invalid_proxy_is_rejected() {
        let result = MetaAiClient::builder()
            .credentials(Credentials::from_mandatory("a", "b"))
            .http_proxy(Some("not a url".into()))
            .build();
        assert!(result.is_err());
    }
}
