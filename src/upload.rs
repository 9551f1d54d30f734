//! Image upload through the rupload endpoint.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, USER_AGENT};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::client::{read_response, MetaAiClient};
use crate::error::MetaAiError;
use crate::poll::{poll_until, AttemptOutcome, Backoff, PollPolicy};
use crate::types::UploadedMedia;

const UPLOAD_PATH: &str = "gen_ai_document_gen_ai_tenant/";
const MEDIA_ID_KEYS: [&str; 5] = ["mediaId", "media_id", "id", "uploadId", "entityId"];
const MAX_SEARCH_DEPTH: usize = 5;

/// Retry bounds for uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_secs(1), Duration::from_secs(8)),
        }
    }
}

/// Finds the media id in an upload response.
///
/// A top-level `media_id` wins; otherwise the first non-empty id-like field found
/// breadth-first up to a small depth.
pub fn extract_media_id(response: &Value) -> Option<String> {
    fn as_id(value: &Value) -> Option<String> {
        match value {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    if let Some(id) = response.get("media_id").and_then(as_id) {
        return Some(id);
    }

    let mut level = vec![response];
    for _ in 0..=MAX_SEARCH_DEPTH {
        let mut next = Vec::new();
        for value in level {
            match value {
                Value::Object(map) => {
                    let found = MEDIA_ID_KEYS
                        .iter()
                        .find_map(|key| map.get(*key).and_then(as_id));
                    if let Some(id) = found {
                        return Some(id);
                    }
                    next.extend(map.values());
                }
                Value::Array(items) => next.extend(items.iter()),
                _ => {}
            }
        }
        if next.is_empty() {
            break;
        }
        level = next;
    }
    None
}

/// Parses an upload response body: JSON, or `key=value&...` as a fallback.
fn parse_upload_body(body: &str) -> Value {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return value;
    }
    let map: serde_json::Map<String, Value> = url::form_urlencoded::parse(body.trim().as_bytes())
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| (key.into_owned(), Value::String(value.into_owned())))
        .collect();
    Value::Object(map)
}

/// `x-entity-name` is percent-encoded with spaces as `%20`.
fn encode_entity_name(file_name: &str) -> String {
    url::form_urlencoded::byte_serialize(file_name.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Turns a raw `ecto_1_sess` cookie into the bearer form.
fn token_from_session_cookie(cookie: &str) -> String {
    // The cookie is stored percent-encoded (`%3A` for `:`).
    let decoded = url::form_urlencoded::parse(cookie.as_bytes())
        .next()
        .map(|(key, _)| key.into_owned())
        .unwrap_or_else(|| cookie.to_string());
    if decoded.starts_with("ecto1:") {
        decoded
    } else {
        format!("ecto1:{decoded}")
    }
}

enum Payload {
    Bytes(Vec<u8>),
    File(PathBuf),
}

impl Payload {
    /// A fresh body for each attempt; files are streamed from disk.
    async fn body(&self) -> Result<reqwest::Body, MetaAiError> {
        match self {
            Payload::Bytes(bytes) => Ok(reqwest::Body::from(bytes.clone())),
            Payload::File(path) => {
                let file = File::open(path).await?;
                let stream = FramedRead::new(file, BytesCodec::new());
                Ok(reqwest::Body::wrap_stream(stream))
            }
        }
    }
}

struct Upload<'a> {
    token: String,
    payload: Payload,
    file_name: &'a str,
    file_size: u64,
    mime_type: &'a str,
}

enum Attempt {
    Uploaded(UploadedMedia),
    Retry { error_type: String, message: String },
}

#[derive(Default)]
struct UploadState {
    uploaded: Option<UploadedMedia>,
    last_failure: Option<(String, String)>,
}

impl MetaAiClient {
    /// Uploads an in-memory image and returns its media id.
    ///
    /// `mime` defaults to a guess from `file_name`, then to `image/jpeg`.
    ///
    /// # Errors
    ///
    /// - `MetaAiError::MissingBearerToken` if neither a bearer token nor the
    ///   `ecto_1_sess` cookie is available.
    /// - `MetaAiError::InvalidMediaType` for anything that is not `image/*`.
    /// - `MetaAiError::UploadRejected` if the endpoint refuses the upload or every
    ///   attempt failed.
    pub async fn upload_image(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        mime: Option<&str>,
    ) -> Result<UploadedMedia, MetaAiError> {
        let mime_type = mime
            .map(str::to_string)
            .unwrap_or_else(|| guess_mime(Path::new(file_name)));
        let file_size = bytes.len() as u64;
        self.upload(Payload::Bytes(bytes), file_name, file_size, &mime_type)
            .await
    }

    /// Uploads an image from disk, streaming its content.
    pub async fn upload_image_file<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> Result<UploadedMedia, MetaAiError> {
        let path = path.as_ref();
        let file_size = tokio::fs::metadata(path).await?.len();
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                MetaAiError::InvalidRequest(format!("invalid file path: {}", path.display()))
            })?
            .to_string();
        let mime_type = guess_mime(path);
        self.upload(Payload::File(path.to_path_buf()), &file_name, file_size, &mime_type)
            .await
    }

    #[instrument(skip(self, payload))]
    async fn upload(
        &self,
        payload: Payload,
        file_name: &str,
        file_size: u64,
        mime_type: &str,
    ) -> Result<UploadedMedia, MetaAiError> {
        let credentials = self.credentials.snapshot().await;
        let token = credentials
            .bearer_token()
            .map(str::to_string)
            .or_else(|| credentials.cookie("ecto_1_sess").map(token_from_session_cookie))
            .ok_or(MetaAiError::MissingBearerToken)?;
        if !mime_type.starts_with("image/") {
            return Err(MetaAiError::InvalidMediaType(mime_type.to_string()));
        }

        let upload = Upload {
            token,
            payload,
            file_name,
            file_size,
            mime_type,
        };
        let policy = PollPolicy {
            max_attempts: self.upload_policy.max_attempts,
            initial_delay: Duration::ZERO,
            backoff: self.upload_policy.backoff,
        };
        let mut state = UploadState::default();
        let report = poll_until(
            &policy,
            "upload",
            &mut state,
            |_, number| {
                let upload = &upload;
                async move {
                    match self.upload_once(upload, number).await {
                        Ok(attempt) => AttemptOutcome::Ready(attempt),
                        Err(err @ MetaAiError::RequestFailed(_)) => {
                            AttemptOutcome::Ready(Attempt::Retry {
                                error_type: "network".into(),
                                message: err.to_string(),
                            })
                        }
                        Err(err) => AttemptOutcome::Fatal(err),
                    }
                }
            },
            |state: &mut UploadState, attempt| match attempt {
                Attempt::Uploaded(media) => {
                    state.uploaded = Some(media);
                    true
                }
                Attempt::Retry { error_type, message } => {
                    state.last_failure = Some((error_type, message));
                    false
                }
            },
        )
        .await?;

        if let Some(media) = state.uploaded {
            info!(media_id = %media.media_id, attempts = report.attempts, "upload complete");
            return Ok(media);
        }
        let (error_type, message) = state
            .last_failure
            .unwrap_or_else(|| ("unknown".into(), "upload was not attempted".into()));
        Err(MetaAiError::UploadRejected {
            error_type,
            message: format!("upload failed after {} attempts: {message}", report.attempts),
            retriable: true,
        })
    }

    async fn upload_once(&self, upload: &Upload<'_>, attempt: u32) -> Result<Attempt, MetaAiError> {
        let session_id = Uuid::new_v4().to_string();
        let url = self.upload_url.join(UPLOAD_PATH)?.join(&session_id)?;
        info!(
            file_name = upload.file_name,
            file_size = upload.file_size,
            mime_type = upload.mime_type,
            attempt,
            "uploading image"
        );

        let response = self
            .client
            .post(url)
            .headers(upload_headers(upload, &self.profile.user_agent)?)
            .body(upload.payload.body().await?)
            .send()
            .await?;
        let (status, _, body) = read_response(response).await?;
        self.guard.check(status, &body).await?;

        if (200..300).contains(&status) {
            let parsed = parse_upload_body(&body);
            let media_id = extract_media_id(&parsed).ok_or_else(|| MetaAiError::UploadRejected {
                error_type: "missing_media_id".into(),
                message: "upload succeeded but no media id was returned".into(),
                retriable: false,
            })?;
            return Ok(Attempt::Uploaded(UploadedMedia {
                media_id,
                upload_session_id: session_id,
                file_name: upload.file_name.to_string(),
                file_size: upload.file_size,
                mime_type: upload.mime_type.to_string(),
            }));
        }

        if status == 412 {
            let Ok(parsed) = serde_json::from_str::<Value>(&body) else {
                warn!(status, "unparseable precondition failure, retrying");
                return Ok(Attempt::Retry {
                    error_type: "precondition_failed".into(),
                    message: crate::decode::excerpt(&body),
                });
            };
            let info = parsed.get("debug_info").cloned().unwrap_or(Value::Null);
            let retriable = info.get("retriable").and_then(Value::as_bool).unwrap_or(false);
            let error_type = info
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("Unknown")
                .to_string();
            let message = info
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string();
            warn!(%error_type, %message, retriable, "upload precondition failed");
            if retriable {
                return Ok(Attempt::Retry { error_type, message });
            }
            return Err(MetaAiError::UploadRejected {
                error_type,
                message,
                retriable: false,
            });
        }

        if status >= 500 {
            warn!(status, "upload endpoint error, retrying");
            return Ok(Attempt::Retry {
                error_type: format!("http_{status}"),
                message: crate::decode::excerpt(&body),
            });
        }

        Err(MetaAiError::UploadRejected {
            error_type: format!("http_{status}"),
            message: crate::decode::excerpt(&body),
            retriable: false,
        })
    }
}

fn guess_mime(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("image/jpeg")
        .to_string()
}

fn upload_headers(upload: &Upload<'_>, user_agent: &str) -> Result<HeaderMap, MetaAiError> {
    let invalid = |name: &str| {
        MetaAiError::InvalidRequest(format!("invalid value for upload header {name}"))
    };
    let mut headers = HeaderMap::new();
    let mut insert = |name: &'static str, value: &str| -> Result<(), MetaAiError> {
        let value = HeaderValue::from_str(value).map_err(|_| invalid(name))?;
        headers.insert(HeaderName::from_static(name), value);
        Ok(())
    };
    insert("desired_upload_handler", "genai_document")?;
    insert("ecto_auth_token", "true")?;
    insert("is_abra_user", "true")?;
    insert("offset", "0")?;
    insert("x-entity-length", &upload.file_size.to_string())?;
    insert("x-entity-name", &encode_entity_name(upload.file_name))?;
    insert("x-entity-type", upload.mime_type)?;

    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("OAuth {}", upload.token))
            .map_err(|_| invalid("authorization"))?,
    );
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(user_agent).map_err(|_| invalid("user-agent"))?,
    );
    Ok(headers)
}
