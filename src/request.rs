//! Builds provider requests from a [`GenerationRequest`] and a credential snapshot.
//!
//! Everything here is pure: the same inputs always produce the same request, the input
//! request is never modified and no I/O happens. Document ids and header sets are
//! fingerprints of the web client and change whenever the provider ships a new build.

use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, COOKIE, ORIGIN,
    REFERER, USER_AGENT,
};
use serde_json::{json, Value};
use url::Url;

use crate::credentials::Credentials;
use crate::error::MetaAiError;
use crate::types::{GenerationKind, GenerationRequest};

pub const DEFAULT_BASE_URL: &str = "https://www.meta.ai/";
pub const GRAPHQL_PATH: &str = "api/graphql/";

/// Image and video generation mutation.
pub const GENERATION_DOC_ID: &str = "904075722675ba2c1a7b333d4c525a1b";
pub const GENERATION_FRIENDLY_NAME: &str = "useKadabraSendMessageMutation";

/// Query returning the requester's recent media, including a given media id.
pub const MEDIA_FETCH_DOC_ID: &str = "10b7bd5aa8b7537e573e49d701a5b21b";
pub const MEDIA_FETCH_FRIENDLY_NAME: &str = "KadabraPromptRootQuery";

/// Legacy send-message mutation, used for plain text prompts.
pub const TEXT_DOC_ID: &str = "7783822248314888";
pub const TEXT_FRIENDLY_NAME: &str = "useAbraSendMessageMutation";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/144.0.0.0 Safari/537.36 Edg/144.0.0.0";

const SEC_CH_UA: &str = r#""Not(A:Brand";v="8", "Chromium";v="144", "Microsoft Edge";v="144""#;

/// Client-side facts the provider expects to see in every request.
#[derive(Debug, Clone)]
pub struct ClientProfile {
    pub user_agent: String,
    pub locale: String,
    pub timezone: String,
    pub device_pixel_ratio: f64,
}

impl Default for ClientProfile {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            locale: "en-US".to_string(),
            timezone: "UTC".to_string(),
            device_pixel_ratio: 1.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Value),
    Form(Vec<(String, String)>),
}

/// A fully built provider call, ready to hand to `reqwest`.
#[derive(Debug, Clone)]
pub struct ProtocolRequest {
    pub url: Url,
    pub headers: HeaderMap,
    pub body: RequestBody,
    pub doc_id: &'static str,
    pub friendly_name: &'static str,
}

impl ProtocolRequest {
    pub(crate) fn into_builder(self, http: &reqwest::Client) -> reqwest::RequestBuilder {
        let builder = http.post(self.url).headers(self.headers);
        match self.body {
            RequestBody::Json(body) => builder.json(&body),
            RequestBody::Form(fields) => builder.form(&fields),
        }
    }
}

/// `{base}/prompt/{conversation_id}`, the page a conversation is rendered on.
pub fn conversation_url(base_url: &Url, conversation_id: &str) -> Result<Url, MetaAiError> {
    Ok(base_url.join(&format!("prompt/{conversation_id}"))?)
}

fn header_value(value: &str) -> Result<HeaderValue, MetaAiError> {
    HeaderValue::from_str(value)
        .map_err(|_| MetaAiError::InvalidRequest(format!("value is not a valid header: {value:?}")))
}

fn browser_headers(
    profile: &ClientProfile,
    credentials: &Credentials,
    base_url: &Url,
    conversation_id: &str,
) -> Result<HeaderMap, MetaAiError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("multipart/mixed, application/json"));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(ORIGIN, header_value(base_url.origin().ascii_serialization().as_str())?);
    headers.insert(
        REFERER,
        header_value(conversation_url(base_url, conversation_id)?.as_str())?,
    );
    headers.insert(USER_AGENT, header_value(&profile.user_agent)?);
    headers.insert(HeaderName::from_static("sec-ch-ua"), HeaderValue::from_static(SEC_CH_UA));
    headers.insert(HeaderName::from_static("sec-ch-ua-mobile"), HeaderValue::from_static("?0"));
    headers.insert(
        HeaderName::from_static("sec-ch-ua-platform"),
        HeaderValue::from_static("\"Windows\""),
    );
    headers.insert(HeaderName::from_static("sec-fetch-dest"), HeaderValue::from_static("empty"));
    headers.insert(HeaderName::from_static("sec-fetch-mode"), HeaderValue::from_static("cors"));
    headers.insert(
        HeaderName::from_static("sec-fetch-site"),
        HeaderValue::from_static("same-origin"),
    );
    headers.insert(COOKIE, header_value(&credentials.cookie_header())?);
    Ok(headers)
}

/// Builds the generation call for `request`.
///
/// Image and video prompts use the JSON "create" mutation; text prompts use the legacy
/// form-encoded mutation. The prompt appears exactly once in the body.
pub fn build_generation(
    request: &GenerationRequest,
    credentials: &Credentials,
    profile: &ClientProfile,
    base_url: &Url,
) -> Result<ProtocolRequest, MetaAiError> {
    request.validate()?;
    let ids = &request.correlation;
    let url = base_url.join(GRAPHQL_PATH)?;
    let mut headers = browser_headers(profile, credentials, base_url, &ids.conversation_id)?;

    let attachment_input = (!request.media_ids.is_empty()).then(|| {
        let metadata = request.attachment_metadata.clone().unwrap_or_default();
        json!({
            "attachment_size": metadata.file_size,
            "attachment_type": metadata.mime_type,
        })
    });

    let (operation, prefix) = match request.kind {
        GenerationKind::Image => ("TEXT_TO_IMAGE", "Imagine"),
        GenerationKind::Video => ("TEXT_TO_VIDEO", "Animate"),
        GenerationKind::Text => {
            let variables = json!({
                "message": { "sensitive_string_value": request.prompt },
                "externalConversationId": ids.conversation_id,
                "offlineThreadingId": ids.offline_threading_id,
                "suggestedPromptIndex": null,
                "promptPrefix": null,
                "entrypoint": "ABRA__CHAT__TEXT",
                "attachments": [],
                "attachmentsV2": request.media_ids,
                "messagePersistentInput": attachment_input,
                "icebreaker_type": "TEXT",
                "__relay_internal__pv__AbraDebugDevOnlyrelayprovider": false,
                "__relay_internal__pv__WebPixelRatiorelayprovider": 1,
            });
            let mut fields = vec![
                ("fb_api_caller_class".to_string(), "RelayModern".to_string()),
                ("fb_api_req_friendly_name".to_string(), TEXT_FRIENDLY_NAME.to_string()),
                ("variables".to_string(), variables.to_string()),
                ("server_timestamps".to_string(), "true".to_string()),
                ("doc_id".to_string(), TEXT_DOC_ID.to_string()),
            ];
            if let Some(token) = credentials.bearer_token() {
                fields.push(("access_token".to_string(), token.to_string()));
            }
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            );
            headers.insert(
                HeaderName::from_static("x-fb-friendly-name"),
                HeaderValue::from_static(TEXT_FRIENDLY_NAME),
            );
            return Ok(ProtocolRequest {
                url,
                headers,
                body: RequestBody::Form(fields),
                doc_id: TEXT_DOC_ID,
                friendly_name: TEXT_FRIENDLY_NAME,
            });
        }
    };

    let params = match request.kind {
        GenerationKind::Video => json!({}),
        _ => json!({ "orientation": request.orientation.as_str() }),
    };

    let variables = json!({
        "conversationId": ids.conversation_id,
        "content": format!("{prefix} {}", request.prompt),
        "userMessageId": ids.user_message_id,
        "assistantMessageId": ids.assistant_message_id,
        "userUniqueMessageId": ids.user_unique_message_id,
        "turnId": ids.turn_id,
        "spaceId": null,
        "mode": "create",
        "rewriteOptions": null,
        "attachments": null,
        "attachmentsV2": request.media_ids,
        "messagePersistentInput": attachment_input,
        "mentions": null,
        "clippyIp": null,
        "isNewConversation": ids.is_new_conversation,
        "imagineOperationRequest": {
            "operation": operation,
            "textToImageParams": params,
        },
        "qplJoinId": null,
        "clientTimezone": profile.timezone,
        "developerOverridesForMessage": null,
        "clientLatitude": null,
        "clientLongitude": null,
        "devicePixelRatio": profile.device_pixel_ratio,
        "entryPoint": null,
        "promptSessionId": ids.prompt_session_id,
        "promptType": null,
        "conversationStarterId": null,
        "userAgent": profile.user_agent,
        "currentBranchPath": null,
        "promptEditType": "new_message",
        "userLocale": profile.locale,
        "userEventId": null,
    });

    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(ProtocolRequest {
        url,
        headers,
        body: RequestBody::Json(json!({
            "doc_id": GENERATION_DOC_ID,
            "variables": variables,
        })),
        doc_id: GENERATION_DOC_ID,
        friendly_name: GENERATION_FRIENDLY_NAME,
    })
}

/// Builds the "media by id" query used while polling for URLs.
pub fn build_media_fetch(
    media_id: &str,
    conversation_id: &str,
    credentials: &Credentials,
    profile: &ClientProfile,
    base_url: &Url,
) -> Result<ProtocolRequest, MetaAiError> {
    let url = base_url.join(GRAPHQL_PATH)?;
    let mut headers = browser_headers(profile, credentials, base_url, conversation_id)?;
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        HeaderName::from_static("x-fb-friendly-name"),
        HeaderValue::from_static(MEDIA_FETCH_FRIENDLY_NAME),
    );

    Ok(ProtocolRequest {
        url,
        headers,
        body: RequestBody::Json(json!({
            "doc_id": MEDIA_FETCH_DOC_ID,
            "variables": {
                "mediaId": media_id,
                "__relay_internal__pv__KadabraVideoDeliveryRequestrelayprovider": {
                    "dash_manifest_requests": [{}],
                    "progressive_url_requests": [{ "quality": "HD" }, { "quality": "SD" }],
                },
            },
        })),
        doc_id: MEDIA_FETCH_DOC_ID,
        friendly_name: MEDIA_FETCH_FRIENDLY_NAME,
    })
}
