//! Ordered media extraction strategies.
//!
//! The provider returns media in several unrelated JSON shapes depending on the
//! endpoint and client build. Each strategy knows one shape and returns `None` when the
//! shape is absent; [`extract_media`] takes the first strategy that finds anything.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::types::{MediaKind, MediaPlaceholder};

/// A named way of finding media in a decoded response.
pub struct ExtractionStrategy {
    pub name: &'static str,
    pub extract: fn(&Value) -> Option<Vec<MediaPlaceholder>>,
}

/// Strategies in the order they are tried.
pub static STRATEGIES: &[ExtractionStrategy] = &[
    ExtractionStrategy { name: "send_message_edges", extract: send_message_edges },
    ExtractionStrategy { name: "fetch_post_edges", extract: fetch_post_edges },
    ExtractionStrategy { name: "media_generated_event", extract: media_generated_event },
    ExtractionStrategy { name: "bot_message_imagine", extract: bot_message_imagine },
    ExtractionStrategy { name: "bot_message_attachments", extract: bot_message_attachments },
    ExtractionStrategy { name: "raw_cdn_urls", extract: raw_cdn_urls },
];

static RAW_VIDEO_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"https?://[^\s"'<>\\]+fbcdn[^\s"'<>\\]+\.mp4[^\s"'<>\\]*"#).unwrap()
});

/// Runs the strategies in order and returns the first non-empty result with its name.
pub fn extract_media(value: &Value) -> Option<(&'static str, Vec<MediaPlaceholder>)> {
    STRATEGIES.iter().find_map(|strategy| {
        (strategy.extract)(value)
            .filter(|found| !found.is_empty())
            .map(|found| (strategy.name, dedupe(found)))
    })
}

/// Keeps the first occurrence of every id; later duplicates only fill missing fields.
pub fn dedupe(items: Vec<MediaPlaceholder>) -> Vec<MediaPlaceholder> {
    let mut unique: Vec<MediaPlaceholder> = Vec::with_capacity(items.len());
    for item in items {
        match unique.iter_mut().find(|existing| existing.id == item.id) {
            Some(existing) => existing.absorb(&item),
            None => unique.push(item),
        }
    }
    unique
}

fn non_empty(items: Vec<MediaPlaceholder>) -> Option<Vec<MediaPlaceholder>> {
    (!items.is_empty()).then_some(items)
}

fn str_field<'a>(node: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| node.get(*key))
        .find_map(|value| value.as_str().filter(|s| !s.is_empty()))
}

fn id_field(node: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().filter_map(|key| node.get(*key)).find_map(|value| match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn u32_field(node: &Value, key: &str) -> Option<u32> {
    node.get(key)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
}

fn progressive_url(node: &Value) -> Option<&str> {
    node.pointer("/videoDeliveryResponseResult/progressive_urls")?
        .as_array()?
        .iter()
        .find_map(|entry| str_field(entry, &["progressive_url"]))
}

/// Builds a placeholder from any media-like node. The url falls back to the id when the
/// provider omits one.
pub(crate) fn placeholder_from_node(node: &Value, kind: MediaKind) -> Option<MediaPlaceholder> {
    let url = match kind {
        MediaKind::Video => {
            str_field(node, &["video_url", "uri", "url"]).or_else(|| progressive_url(node))
        }
        MediaKind::Image => str_field(node, &["uri", "url", "image_uri", "maybe_image_uri"]),
    }
    .map(str::to_string);

    let id = id_field(node, &["id", "media_id", "mediaId"]).or_else(|| url.clone())?;

    Some(MediaPlaceholder {
        id,
        url,
        kind,
        thumbnail: str_field(node, &["thumbnail_uri", "thumbnailUri", "preview_uri"])
            .map(str::to_string),
        width: u32_field(node, "width"),
        height: u32_field(node, "height"),
        orientation: str_field(node, &["orientation"]).map(str::to_string),
        source_media_id: id_field(node, &["source_media_id", "sourceMediaId"])
            .or_else(|| node.get("source_image").and_then(|source| id_field(source, &["id"]))),
    })
}

fn nodes_at<'a>(value: &'a Value, pointer: &str) -> impl Iterator<Item = &'a Value> {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

/// Media inside `messages.edges[].node.content` of the create and fetch responses.
fn media_from_edges(messages: &Value) -> Vec<MediaPlaceholder> {
    let mut found = Vec::new();
    for edge in nodes_at(messages, "/edges") {
        let Some(content) = edge.pointer("/node/content") else {
            continue;
        };
        found.extend(
            nodes_at(content, "/imagine_media/images/nodes")
                .filter_map(|node| placeholder_from_node(node, MediaKind::Image)),
        );
        found.extend(
            nodes_at(content, "/imagine_video/videos/nodes")
                .filter_map(|node| placeholder_from_node(node, MediaKind::Video)),
        );
        if let Some(video) = content.pointer("/imagine_video/video").filter(|v| v.is_object()) {
            found.extend(placeholder_from_node(video, MediaKind::Video));
        }
    }
    found
}

fn send_message_edges(value: &Value) -> Option<Vec<MediaPlaceholder>> {
    let messages = value.pointer("/data/xfb_imagine_send_message/messages")?;
    non_empty(media_from_edges(messages))
}

fn fetch_post_edges(value: &Value) -> Option<Vec<MediaPlaceholder>> {
    let messages = value
        .pointer("/data/xfb_genai_fetch_post/messages")
        .or_else(|| value.pointer("/data/xab_abra__xfb_genai_fetch_post/messages"))?;
    non_empty(media_from_edges(messages))
}

/// `{"type":"media_generated","mediaIds":[...]}` stream events. Ids only, no urls.
fn media_generated_event(value: &Value) -> Option<Vec<MediaPlaceholder>> {
    if value.get("type").and_then(Value::as_str) != Some("media_generated") {
        return None;
    }
    let kind = match value.get("mediaType").and_then(Value::as_str) {
        Some(t) if t.eq_ignore_ascii_case("image") => MediaKind::Image,
        _ => MediaKind::Video,
    };
    let ids = nodes_at(value, "/mediaIds").filter_map(|id| match id {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });
    non_empty(ids.map(|id| MediaPlaceholder::pending(id, kind)).collect())
}

/// The assistant message in legacy send-message responses.
pub(crate) fn bot_message(value: &Value) -> Option<&Value> {
    value
        .pointer("/data/node/bot_response_message")
        .or_else(|| value.pointer("/data/message"))
        .filter(|v| v.is_object())
}

fn bot_message_imagine(value: &Value) -> Option<Vec<MediaPlaceholder>> {
    let message = bot_message(value)?;
    let media_sets = message
        .pointer("/content/imagine/session/media_sets")
        .or_else(|| message.pointer("/imagine_card/session/media_sets"))?;
    let found = media_sets
        .as_array()?
        .iter()
        .flat_map(|set| nodes_at(set, "/imagine_media"))
        .filter_map(|media| {
            let kind = match media.get("media_type").and_then(Value::as_str) {
                Some("VIDEO") => MediaKind::Video,
                _ => MediaKind::Image,
            };
            placeholder_from_node(media, kind)
        })
        .collect();
    non_empty(found)
}

fn bot_message_attachments(value: &Value) -> Option<Vec<MediaPlaceholder>> {
    let message = bot_message(value)?;
    let mut found: Vec<MediaPlaceholder> = nodes_at(message, "/image_attachments")
        .filter_map(|attachment| {
            let url = str_field(attachment, &["uri", "url"])?.to_ascii_lowercase();
            let kind = if url.contains(".mp4") || url.contains(".m4v") {
                MediaKind::Video
            } else {
                MediaKind::Image
            };
            placeholder_from_node(attachment, kind)
        })
        .collect();

    if let Some(sets) = message.pointer("/video_generation/media_sets").and_then(Value::as_array) {
        found.extend(
            sets.iter()
                .flat_map(|set| nodes_at(set, "/video_media"))
                .filter_map(|media| placeholder_from_node(media, MediaKind::Video)),
        );
    }
    for field in ["video_media", "generated_video", "reels"] {
        found.extend(
            nodes_at(message, &format!("/{field}"))
                .filter_map(|media| placeholder_from_node(media, MediaKind::Video)),
        );
    }
    non_empty(found)
}

/// Last resort: CDN video urls anywhere in the document.
fn raw_cdn_urls(value: &Value) -> Option<Vec<MediaPlaceholder>> {
    let text = value.to_string();
    let found = RAW_VIDEO_URL_RE
        .find_iter(&text)
        .map(|m| {
            let mut placeholder = MediaPlaceholder::pending(m.as_str(), MediaKind::Video);
            placeholder.url = Some(m.as_str().to_string());
            placeholder
        })
        .collect();
    non_empty(found)
}

/// The conversation id, if the response names one.
pub fn conversation_id(value: &Value) -> Option<String> {
    if let Some(id) = str_field(value, &["conversationId", "conversation_id"]) {
        return Some(id.to_string());
    }
    for pointer in [
        "/data/xfb_imagine_send_message/conversation/id",
        "/data/xfb_imagine_send_message/conversationId",
        "/data/xfb_genai_fetch_post/conversation/id",
    ] {
        if let Some(id) = value.pointer(pointer).and_then(Value::as_str) {
            return Some(id.to_string());
        }
    }
    let message = bot_message(value)?;
    let id = str_field(message, &["id"])?;
    id.split('_').next().map(str::to_string)
}

/// The provider's streaming state, e.g. `STREAMING` or `OVERALL_DONE`.
pub fn streaming_state(value: &Value) -> Option<String> {
    str_field(value, &["streaming_state", "streamingState"])
        .or_else(|| bot_message(value).and_then(|m| str_field(m, &["streaming_state"])))
        .map(str::to_string)
}

/// The assistant's text reply, joined from its composed text blocks.
pub fn assistant_text(value: &Value) -> Option<String> {
    let message = bot_message(value)?;
    let text = nodes_at(message, "/composed_text/content")
        .filter_map(|block| str_field(block, &["text"]))
        .collect::<Vec<_>>()
        .join("\n");
    (!text.is_empty()).then_some(text)
}
