//! Session cookies and the derived bearer token.
//!
//! Cookies come from explicit values first, then `META_AI_*` environment variables, and
//! only as a last resort from scraping the public landing page. The bearer token is
//! derived from an authenticated landing-page fetch and refreshed periodically or on
//! demand after an auth failure.

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, SET_COOKIE, USER_AGENT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::MetaAiError;

/// Cookies without which no request can succeed.
pub const MANDATORY_COOKIES: [&str; 2] = ["datr", "abra_sess"];

/// Cookies that are forwarded when known.
pub const OPTIONAL_COOKIES: [&str; 8] = [
    "ecto_1_sess",
    "dpr",
    "wd",
    "_js_datr",
    "abra_csrf",
    "rd_challenge",
    "ps_l",
    "ps_n",
];

/// Default minimum time between two non-forced refreshes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

static ACCESS_TOKEN_ESCAPED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"accessToken\\":\\"(ecto1:[^"\\]+)"#).unwrap());

static ACCESS_TOKEN_PLAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""accessToken":"(ecto1:[^"]+)""#).unwrap());

static CHALLENGE_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"fetch\(['"](/__rd_verify[^'"]+)['"]"#).unwrap());

/// The environment variable that carries a cookie, e.g. `_js_datr` -> `META_AI_JS_DATR`.
pub fn env_var_for(cookie: &str) -> String {
    format!("META_AI_{}", cookie.trim_start_matches('_').to_ascii_uppercase())
}

fn is_known_cookie(name: &str) -> bool {
    MANDATORY_COOKIES.contains(&name) || OPTIONAL_COOKIES.contains(&name)
}

/// A short, log-safe prefix of a secret.
pub(crate) fn preview(secret: &str) -> String {
    let head: String = secret.chars().take(6).collect();
    if secret.chars().count() > 6 {
        format!("{head}...")
    } else {
        "***".to_string()
    }
}

/// A snapshot of the session: named cookies plus the optional bearer token.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    cookies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bearer_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cookies: BTreeMap<&str, String> = self
            .cookies
            .iter()
            .map(|(name, value)| (name.as_str(), preview(value)))
            .collect();
        f.debug_struct("Credentials")
            .field("cookies", &cookies)
            .field("bearer_token", &self.bearer_token.as_deref().map(preview))
            .finish()
    }
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for the two mandatory cookies.
    pub fn from_mandatory(datr: impl Into<String>, abra_sess: impl Into<String>) -> Self {
        Self::new().with_cookie("datr", datr).with_cookie("abra_sess", abra_sess)
    }

    /// Sets a cookie. Empty values are ignored.
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_cookie(name, value);
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        if !token.is_empty() {
            self.bearer_token = Some(token);
        }
        self
    }

    pub(crate) fn set_cookie(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        if !value.trim().is_empty() {
            self.cookies.insert(name.into(), value);
        }
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.bearer_token.as_deref()
    }

    /// Names of the mandatory cookies that are absent.
    pub fn missing_mandatory(&self) -> Vec<&'static str> {
        MANDATORY_COOKIES
            .iter()
            .copied()
            .filter(|name| self.cookie(name).is_none())
            .collect()
    }

    pub fn validate(&self) -> Result<(), MetaAiError> {
        let missing = self.missing_mandatory();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(MetaAiError::MissingCredentials { missing })
        }
    }

    /// The `Cookie` header value for this snapshot.
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Fills every slot that is still empty from `other`.
    pub fn fill_missing_from(&mut self, other: &Credentials) {
        for (name, value) in &other.cookies {
            self.cookies.entry(name.clone()).or_insert_with(|| value.clone());
        }
        if self.bearer_token.is_none() {
            self.bearer_token.clone_from(&other.bearer_token);
        }
    }

    /// Merges explicit values over values found through `env`.
    ///
    /// Explicit values win per cookie. No I/O happens here besides calling `env`.
    pub fn resolve<F>(explicit: Option<Credentials>, env: F) -> Credentials
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut resolved = explicit.unwrap_or_default();
        for name in MANDATORY_COOKIES.iter().chain(OPTIONAL_COOKIES.iter()) {
            if resolved.cookie(name).is_some() {
                continue;
            }
            if let Some(value) = env(&env_var_for(name)) {
                resolved.set_cookie(*name, value);
            }
        }
        resolved
    }

    /// Reads every known cookie from the process environment.
    pub fn from_env() -> Credentials {
        Self::resolve(None, |key| std::env::var(key).ok())
    }

    /// Loads a credential cache written by [`Credentials::save_to`].
    pub async fn load_from<P: AsRef<Path>>(path: P) -> Result<Credentials, MetaAiError> {
        let raw = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), MetaAiError> {
        let raw = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, raw).await?;
        Ok(())
    }

    fn absorb_set_cookies(&mut self, set_cookies: &[(String, String)]) -> usize {
        let mut updated = 0;
        for (name, value) in set_cookies {
            if is_known_cookie(name) && self.cookie(name) != Some(value.as_str()) {
                self.set_cookie(name.clone(), value.clone());
                updated += 1;
            }
        }
        updated
    }
}

/// Finds the `ecto1:` bearer token embedded in a landing page.
pub fn extract_access_token(html: &str) -> Option<String> {
    ACCESS_TOKEN_ESCAPED_RE
        .captures(html)
        .or_else(|| ACCESS_TOKEN_PLAIN_RE.captures(html))
        .map(|caps| caps[1].to_string())
}

/// Finds a `"name":{"value":"..."}` pair embedded in a page.
pub fn extract_page_value(html: &str, name: &str) -> Option<String> {
    let pattern = format!(r#""{}":\{{"value":"([^"]+)""#, regex::escape(name));
    let re = Regex::new(&pattern).ok()?;
    re.captures(html).map(|caps| caps[1].to_string())
}

fn parse_set_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|raw| {
            let pair = raw.split(';').next()?;
            let (name, value) = pair.split_once('=')?;
            let value = value.trim().trim_matches('"');
            if value.is_empty() || value == "deleted" {
                return None;
            }
            Some((name.trim().to_string(), value.to_string()))
        })
        .collect()
}

struct LandingPage {
    body: String,
    set_cookies: Vec<(String, String)>,
}

/// Thread-safe owner of the live [`Credentials`].
///
/// Reads take a snapshot; refreshes are serialized and only replace values after a
/// successful re-derivation, so a failed refresh never leaves the store half-updated.
pub struct CredentialStore {
    http: reqwest::Client,
    base_url: Url,
    user_agent: String,
    current: RwLock<Credentials>,
    last_refresh: Mutex<Option<Instant>>,
    min_refresh_interval: Duration,
    cache_path: Option<PathBuf>,
}

impl CredentialStore {
    /// Creates a store. Fails before any network activity if mandatory cookies are missing.
    pub fn new(
        http: reqwest::Client,
        base_url: Url,
        user_agent: impl Into<String>,
        credentials: Credentials,
    ) -> Result<Self, MetaAiError> {
        credentials.validate()?;
        debug!(credentials = ?credentials, "credential store initialised");
        Ok(Self {
            http,
            base_url,
            user_agent: user_agent.into(),
            current: RwLock::new(credentials),
            last_refresh: Mutex::new(None),
            min_refresh_interval: DEFAULT_REFRESH_INTERVAL,
            cache_path: None,
        })
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Persist credentials to `path` after every successful refresh.
    pub fn with_cache_path(mut self, path: Option<PathBuf>) -> Self {
        self.cache_path = path;
        self
    }

    pub fn refresh_interval(&self) -> Duration {
        self.min_refresh_interval
    }

    pub async fn snapshot(&self) -> Credentials {
        self.current.read().await.clone()
    }

    pub async fn bearer_token(&self) -> Option<String> {
        self.current.read().await.bearer_token.clone()
    }

    /// Fetches the landing page with the current cookies and looks for the bearer token.
    ///
    /// Returns `Ok(None)` when the page loads but carries no token.
    #[instrument(skip(self))]
    pub async fn derive_bearer_token(&self) -> Result<Option<String>, MetaAiError> {
        let snapshot = self.snapshot().await;
        let page = self.fetch_landing(Some(&snapshot)).await?;
        Ok(extract_access_token(&page.body))
    }

    /// Re-derives the bearer token and absorbs rotated cookies.
    ///
    /// A landing page without a token still counts as a refresh: rotated cookies are
    /// taken and the previous token is kept. Only a failed page fetch is a failure.
    /// Non-forced calls are throttled by the refresh interval and never return an error;
    /// a forced call returns [`MetaAiError::RefreshFailed`]. A failure keeps the previous
    /// values. Returns whether a refresh happened.
    #[instrument(skip(self))]
    pub async fn refresh(&self, force: bool) -> Result<bool, MetaAiError> {
        let mut last_refresh = self.last_refresh.lock().await;
        if !force {
            if let Some(at) = *last_refresh {
                if at.elapsed() < self.min_refresh_interval {
                    debug!(elapsed = ?at.elapsed(), "refresh throttled");
                    return Ok(false);
                }
            }
        }

        let snapshot = self.snapshot().await;
        match self.rederive(&snapshot).await {
            Ok((token, set_cookies)) => {
                let (refreshed, updated) = {
                    let mut current = self.current.write().await;
                    if let Some(token) = &token {
                        current.bearer_token = Some(token.clone());
                    }
                    let updated = current.absorb_set_cookies(&set_cookies);
                    (current.clone(), updated)
                };
                *last_refresh = Some(Instant::now());
                if let Some(path) = &self.cache_path {
                    if let Err(err) = refreshed.save_to(path).await {
                        warn!(
                            path = %path.display(),
                            error = %err,
                            "failed to write credential cache"
                        );
                    }
                }
                match &token {
                    Some(token) => info!(
                        token = %preview(token),
                        cookies_updated = updated,
                        "credentials refreshed"
                    ),
                    None => warn!(
                        cookies_updated = updated,
                        kept_previous_token = refreshed.bearer_token.is_some(),
                        "landing page carried no access token"
                    ),
                }
                Ok(true)
            }
            Err(err) => {
                warn!(
                    error = %err,
                    force,
                    "credential refresh failed, keeping previous credentials"
                );
                if !force {
                    return Ok(false);
                }
                match err {
                    MetaAiError::RefreshFailed(reason) => Err(MetaAiError::RefreshFailed(reason)),
                    other => Err(MetaAiError::RefreshFailed(other.to_string())),
                }
            }
        }
    }

    /// Refreshes in the background every `every`. Failures are logged and never stop the
    /// loop.
    pub fn spawn_refresh_loop(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                sleep(every).await;
                match self.refresh(false).await {
                    Ok(true) => debug!("background refresh complete"),
                    Ok(false) => debug!("background refresh skipped or failed"),
                    Err(err) => warn!(error = %err, "background refresh failed"),
                }
            }
        })
    }

    async fn rederive(
        &self,
        snapshot: &Credentials,
    ) -> Result<(Option<String>, Vec<(String, String)>), MetaAiError> {
        let page = self.fetch_landing(Some(snapshot)).await?;
        Ok((extract_access_token(&page.body), page.set_cookies))
    }

    /// GETs the landing page, passing a bot-check challenge once if one is served.
    async fn fetch_landing(
        &self,
        credentials: Option<&Credentials>,
    ) -> Result<LandingPage, MetaAiError> {
        fetch_landing(&self.http, &self.base_url, &self.user_agent, credentials).await
    }
}

async fn fetch_landing(
    http: &reqwest::Client,
    base_url: &Url,
    user_agent: &str,
    credentials: Option<&Credentials>,
) -> Result<LandingPage, MetaAiError> {
    let mut credentials = credentials.cloned().unwrap_or_default();
    let mut set_cookies = Vec::new();

    for _ in 0..2 {
        let response = http
            .get(base_url.clone())
            .headers(browser_headers(user_agent, &credentials))
            .send()
            .await?;
        let status = response.status();
        let mut cookies = parse_set_cookies(response.headers());
        let body = response.text().await?;

        if !status.is_success() {
            return Err(MetaAiError::ApiError {
                status: status.as_u16(),
                message: "landing page request failed".into(),
            });
        }

        credentials.absorb_set_cookies(&cookies);
        set_cookies.append(&mut cookies);

        let challenge = CHALLENGE_URL_RE
            .captures(&body)
            .map(|caps| caps[1].to_string())
            .filter(|_| body.contains("executeChallenge"));
        let Some(challenge_path) = challenge else {
            return Ok(LandingPage { body, set_cookies });
        };

        let challenge_url = base_url.join(&challenge_path)?;
        debug!(%challenge_url, "answering landing page challenge");
        let response = http
            .post(challenge_url)
            .headers(browser_headers(user_agent, &credentials))
            .send()
            .await?;
        let mut cookies = parse_set_cookies(response.headers());
        credentials.absorb_set_cookies(&cookies);
        set_cookies.append(&mut cookies);
    }

    Err(MetaAiError::ApiError {
        status: 403,
        message: "landing page kept serving a challenge".into(),
    })
}

fn browser_headers(user_agent: &str, credentials: &Credentials) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(user_agent) {
        headers.insert(USER_AGENT, value);
    }
    let cookie = credentials.cookie_header();
    if !cookie.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            headers.insert(COOKIE, value);
        }
    }
    headers
}

/// Fills missing cookies by scraping the public landing page.
///
/// Values already present in `partial` are kept. The result still has to pass
/// [`Credentials::validate`]; a logged-out page rarely yields a session cookie.
#[instrument(skip(http, partial))]
pub async fn scrape_landing_cookies(
    http: &reqwest::Client,
    base_url: &Url,
    user_agent: &str,
    partial: Credentials,
) -> Result<Credentials, MetaAiError> {
    let page = fetch_landing(http, base_url, user_agent, None).await?;
    let mut scraped = Credentials::new();
    scraped.absorb_set_cookies(&page.set_cookies);
    for name in MANDATORY_COOKIES.iter().chain(OPTIONAL_COOKIES.iter()) {
        if let Some(value) = extract_page_value(&page.body, name) {
            scraped.set_cookie(*name, value);
        }
    }
    if let Some(token) = extract_access_token(&page.body) {
        scraped.bearer_token = Some(token);
    }

    let mut merged = partial;
    merged.fill_missing_from(&scraped);
    Ok(merged)
}
