use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::MetaAiError;

/// What a generation request asks the provider for.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum GenerationKind {
    /// A plain assistant reply. Kept minimal; conversational chat is not supported.
    Text,
    /// One or more still images.
    Image,
    /// A short video clip.
    Video,
}

/// The kind of a single media asset.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl GenerationKind {
    /// The media kind the provider is expected to produce, if any.
    pub fn media_kind(self) -> Option<MediaKind> {
        match self {
            GenerationKind::Text => None,
            GenerationKind::Image => Some(MediaKind::Image),
            GenerationKind::Video => Some(MediaKind::Video),
        }
    }
}

/// Aspect of the generated media.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Orientation {
    #[default]
    Vertical,
    Landscape,
    Square,
}

impl Orientation {
    /// The wire name expected by the provider.
    pub fn as_str(self) -> &'static str {
        match self {
            Orientation::Vertical => "VERTICAL",
            Orientation::Landscape => "LANDSCAPE",
            Orientation::Square => "SQUARE",
        }
    }
}

impl FromStr for Orientation {
    type Err = MetaAiError;

    /// Case-insensitive; legacy names are folded into their current equivalents.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "VERTICAL" | "PORTRAIT" => Ok(Orientation::Vertical),
            "LANDSCAPE" | "HORIZONTAL" => Ok(Orientation::Landscape),
            "SQUARE" => Ok(Orientation::Square),
            other => Err(MetaAiError::InvalidRequest(format!(
                "orientation must be one of VERTICAL, LANDSCAPE, SQUARE (got {other:?})"
            ))),
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size and type of the uploaded files referenced by a request.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct AttachmentMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Identifiers that tie one logical request together on the provider side.
///
/// They are generated once per logical request and travel with it, so a retry of the
/// same [`GenerationRequest`] reuses them.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CorrelationIds {
    pub conversation_id: String,
    pub user_message_id: String,
    pub assistant_message_id: String,
    pub turn_id: String,
    pub prompt_session_id: String,
    /// A 13-digit numeric id derived from the current time.
    pub user_unique_message_id: String,
    /// Millisecond timestamp shifted left by 22 bits with random low bits.
    pub offline_threading_id: String,
    pub is_new_conversation: bool,
}

impl CorrelationIds {
    /// Fresh ids for a brand new conversation.
    pub fn new() -> Self {
        Self::with_conversation(Uuid::new_v4().to_string(), true)
    }

    /// Fresh message ids inside an existing conversation.
    pub fn continuing(conversation_id: impl Into<String>) -> Self {
        Self::with_conversation(conversation_id.into(), false)
    }

    fn with_conversation(conversation_id: String, is_new_conversation: bool) -> Self {
        let now = chrono::Utc::now();
        let micros = now.timestamp_micros().unsigned_abs();
        let random_bits = (Uuid::new_v4().as_u128() as u64) & ((1 << 22) - 1);
        let threading = (now.timestamp_millis().unsigned_abs() << 22) | random_bits;
        Self {
            conversation_id,
            user_message_id: Uuid::new_v4().to_string(),
            assistant_message_id: Uuid::new_v4().to_string(),
            turn_id: Uuid::new_v4().to_string(),
            prompt_session_id: Uuid::new_v4().to_string(),
            user_unique_message_id: format!("{:013}", micros % 10_000_000_000_000),
            offline_threading_id: threading.to_string(),
            is_new_conversation,
        }
    }
}

impl Default for CorrelationIds {
    fn default() -> Self {
        Self::new()
    }
}

/// A single generation request.
///
/// Build one with [`GenerationRequest::image`], [`GenerationRequest::video`] or
/// [`GenerationRequest::text`], then refine it with the `with_*` methods.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GenerationRequest {
    pub kind: GenerationKind,
    pub prompt: String,
    pub orientation: Orientation,
    /// Ids of previously uploaded images, in the order they should be attached.
    #[serde(default)]
    pub media_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_metadata: Option<AttachmentMetadata>,
    pub correlation: CorrelationIds,
}

impl GenerationRequest {
    pub fn new(kind: GenerationKind, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            prompt: prompt.into(),
            orientation: Orientation::default(),
            media_ids: Vec::new(),
            attachment_metadata: None,
            correlation: CorrelationIds::new(),
        }
    }

    pub fn image(prompt: impl Into<String>) -> Self {
        Self::new(GenerationKind::Image, prompt)
    }

    pub fn video(prompt: impl Into<String>) -> Self {
        Self::new(GenerationKind::Video, prompt)
    }

    pub fn text(prompt: impl Into<String>) -> Self {
        Self::new(GenerationKind::Text, prompt)
    }

    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn with_media_ids(mut self, media_ids: Vec<String>) -> Self {
        self.media_ids = media_ids;
        self
    }

    pub fn with_attachment_metadata(mut self, metadata: AttachmentMetadata) -> Self {
        self.attachment_metadata = Some(metadata);
        self
    }

    /// Continue an existing conversation instead of starting a new one.
    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.correlation = CorrelationIds::continuing(conversation_id);
        self
    }

    /// Rejects requests that must never reach the provider.
    pub fn validate(&self) -> Result<(), MetaAiError> {
        if self.prompt.trim().is_empty() {
            return Err(MetaAiError::InvalidRequest("prompt must not be empty".into()));
        }
        if self.media_ids.iter().any(|id| id.trim().is_empty()) {
            return Err(MetaAiError::InvalidRequest("media ids must not be empty".into()));
        }
        Ok(())
    }
}

/// The wire format a provider response arrived in.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Json,
    Multipart,
    EventStream,
}

/// A media asset the provider has acknowledged. A `None` url means "accepted, not yet
/// rendered".
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MediaPlaceholder {
    pub id: String,
    pub url: Option<String>,
    pub kind: MediaKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orientation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_media_id: Option<String>,
}

impl MediaPlaceholder {
    pub fn pending(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            url: None,
            kind,
            thumbnail: None,
            width: None,
            height: None,
            orientation: None,
            source_media_id: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.url.as_deref().is_some_and(|url| !url.is_empty())
    }

    /// Copies known fields from `other` without overwriting anything already set.
    pub(crate) fn absorb(&mut self, other: &MediaPlaceholder) {
        fn fill<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if slot.is_none() {
                slot.clone_from(value);
            }
        }
        if !self.is_resolved() && other.is_resolved() {
            self.url.clone_from(&other.url);
        }
        fill(&mut self.thumbnail, &other.thumbnail);
        fill(&mut self.width, &other.width);
        fill(&mut self.height, &other.height);
        fill(&mut self.orientation, &other.orientation);
        fill(&mut self.source_media_id, &other.source_media_id);
    }

    /// Converts into a final item, if the url is known.
    pub fn into_item(self) -> Option<MediaItem> {
        let url = self.url.filter(|url| !url.is_empty())?;
        Some(MediaItem {
            id: self.id,
            url,
            kind: self.kind,
            thumbnail: self.thumbnail,
            width: self.width,
            height: self.height,
            orientation: self.orientation,
            source_media_id: self.source_media_id,
        })
    }
}

/// The decoded, normalized view of one provider response.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct RawProviderResponse {
    pub transport: Transport,
    pub status: u16,
    pub placeholders: Vec<MediaPlaceholder>,
    pub conversation_id: Option<String>,
    /// The final streaming state reported by the provider, e.g. `OVERALL_DONE`.
    pub streaming_state: Option<String>,
    pub text: Option<String>,
    /// Name of the extraction strategy that produced `placeholders`.
    pub strategy: Option<&'static str>,
}

impl RawProviderResponse {
    pub(crate) fn empty(transport: Transport, status: u16) -> Self {
        Self {
            transport,
            status,
            placeholders: Vec::new(),
            conversation_id: None,
            streaming_state: None,
            text: None,
            strategy: None,
        }
    }

    /// Adds placeholders, keeping first-seen order and never overwriting a known url.
    pub(crate) fn merge_placeholders(&mut self, incoming: Vec<MediaPlaceholder>) {
        for placeholder in incoming {
            match self.placeholders.iter_mut().find(|p| p.id == placeholder.id) {
                Some(existing) => existing.absorb(&placeholder),
                None => self.placeholders.push(placeholder),
            }
        }
    }

    pub fn all_resolved(&self) -> bool {
        !self.placeholders.is_empty() && self.placeholders.iter().all(|p| p.is_resolved())
    }
}

/// A generated asset whose URL is known.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MediaItem {
    pub id: String,
    pub url: String,
    pub kind: MediaKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orientation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_media_id: Option<String>,
}

/// How the media in a result were found.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Every URL was present in the generation response.
    Inline,
    /// URLs were found by polling the media query.
    Polling,
    /// URLs were scraped from the conversation page.
    PageScrape,
    /// Nothing could be resolved.
    Unresolved,
    /// Text replies carry no media.
    None,
}

/// The outcome of a generation call.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GenerationResult {
    pub success: bool,
    pub prompt: String,
    pub kind: GenerationKind,
    pub conversation_id: String,
    pub media: Vec<MediaItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub strategy: ResolutionStrategy,
    /// Polling attempts spent resolving the media.
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GenerationResult {
    /// The resolved URLs, in the order the provider reported the media.
    pub fn urls(&self) -> Vec<String> {
        self.media.iter().map(|m| m.url.clone()).collect()
    }
}

/// A successfully uploaded image, ready to be referenced by a generation request.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UploadedMedia {
    pub media_id: String,
    pub upload_session_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
}
