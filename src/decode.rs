//! Turns a raw provider response into a [`RawProviderResponse`].
//!
//! The provider answers with a single JSON document, a `multipart/mixed` body or a
//! server-sent event stream; legacy endpoints stream newline-delimited JSON. All four
//! are normalized here. Decoding is pure, so the same input always yields the same
//! result, and failures come back as a [`DecodeFailure`] value instead of a panic.

use serde_json::Value;
use std::fmt;

use crate::extract;
use crate::types::{RawProviderResponse, Transport};

const EXCERPT_LIMIT: usize = 500;

/// Why a response could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeFailureKind {
    /// The provider answered with a non-success HTTP status.
    HttpStatus,
    /// The body was empty.
    EmptyBody,
    /// The body did not contain any usable JSON.
    Malformed,
    /// The body only carried GraphQL errors.
    GraphQl,
}

/// A failed decode, carrying enough context to log or report it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFailure {
    pub kind: DecodeFailureKind,
    pub status: u16,
    pub excerpt: String,
}

impl fmt::Display for DecodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            DecodeFailureKind::HttpStatus => "provider returned an error status",
            DecodeFailureKind::EmptyBody => "provider returned an empty body",
            DecodeFailureKind::Malformed => "provider response was not valid JSON",
            DecodeFailureKind::GraphQl => "provider returned GraphQL errors",
        };
        write!(f, "{what} (status {}): {}", self.status, self.excerpt)
    }
}

impl std::error::Error for DecodeFailure {}

impl DecodeFailure {
    fn new(kind: DecodeFailureKind, status: u16, body: &str) -> Self {
        Self {
            kind,
            status,
            excerpt: excerpt(body),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self.kind {
            DecodeFailureKind::HttpStatus => self.status == 429 || self.status >= 500,
            DecodeFailureKind::EmptyBody => true,
            DecodeFailureKind::Malformed | DecodeFailureKind::GraphQl => false,
        }
    }
}

/// The first [`EXCERPT_LIMIT`] characters of `body`.
pub fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(EXCERPT_LIMIT) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

/// Picks the transport from the `Content-Type`, sniffing the body when the header is
/// missing or generic.
pub fn detect_transport(content_type: Option<&str>, body: &str) -> Transport {
    let content_type = content_type.unwrap_or_default().to_ascii_lowercase();
    if content_type.contains("multipart/mixed") {
        return Transport::Multipart;
    }
    if content_type.contains("text/event-stream") {
        return Transport::EventStream;
    }
    let start = body.trim_start();
    if start.starts_with("event:") || start.starts_with("data:") {
        Transport::EventStream
    } else {
        Transport::Json
    }
}

/// Decodes one provider response.
pub fn decode(
    status: u16,
    content_type: Option<&str>,
    body: &str,
) -> Result<RawProviderResponse, DecodeFailure> {
    if !(200..300).contains(&status) {
        return Err(DecodeFailure::new(DecodeFailureKind::HttpStatus, status, body));
    }
    if body.trim().is_empty() {
        return Err(DecodeFailure::new(DecodeFailureKind::EmptyBody, status, body));
    }

    match detect_transport(content_type, body) {
        Transport::Multipart => decode_multipart(status, content_type.unwrap_or_default(), body),
        Transport::EventStream => {
            let events = event_payloads(body);
            fold_documents(Transport::EventStream, status, body, events)
        }
        Transport::Json => match serde_json::from_str::<Value>(body.trim()) {
            Ok(document) => single_document(Transport::Json, status, body, document),
            Err(_) => {
                // Legacy streaming endpoints send one JSON document per line.
                let lines = body
                    .lines()
                    .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
                    .collect::<Vec<_>>();
                fold_documents(Transport::Json, status, body, lines)
            }
        },
    }
}

fn graphql_errors(document: &Value) -> Option<String> {
    let has_data = document.get("data").is_some_and(|data| !data.is_null());
    let errors = document.get("errors")?.as_array()?;
    if has_data || errors.is_empty() {
        return None;
    }
    Some(
        errors
            .iter()
            .filter_map(|e| e.get("message").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

fn single_document(
    transport: Transport,
    status: u16,
    body: &str,
    document: Value,
) -> Result<RawProviderResponse, DecodeFailure> {
    if let Some(message) = graphql_errors(&document) {
        let detail = if message.is_empty() { body } else { message.as_str() };
        return Err(DecodeFailure::new(DecodeFailureKind::GraphQl, status, detail));
    }
    let mut response = RawProviderResponse::empty(transport, status);
    apply_document(&mut response, &document);
    Ok(response)
}

/// Folds a sequence of documents into one running result. Later documents add new
/// placeholders, fill missing urls and update the streaming state.
fn fold_documents(
    transport: Transport,
    status: u16,
    body: &str,
    documents: Vec<Value>,
) -> Result<RawProviderResponse, DecodeFailure> {
    if documents.is_empty() {
        return Err(DecodeFailure::new(DecodeFailureKind::Malformed, status, body));
    }
    let mut response = RawProviderResponse::empty(transport, status);
    for document in &documents {
        apply_document(&mut response, document);
    }
    Ok(response)
}

fn apply_document(response: &mut RawProviderResponse, document: &Value) {
    if let Some((strategy, placeholders)) = extract::extract_media(document) {
        response.strategy.get_or_insert(strategy);
        response.merge_placeholders(placeholders);
    }
    if let Some(id) = extract::conversation_id(document) {
        response.conversation_id.get_or_insert(id);
    }
    if let Some(state) = extract::streaming_state(document) {
        response.streaming_state = Some(state);
    }
    if let Some(text) = extract::assistant_text(document) {
        response.text = Some(text);
    }
}

/// JSON payloads of every `data:` line in an event stream. Multi-line data fields are
/// joined; non-JSON payloads such as `[DONE]` are skipped.
fn event_payloads(body: &str) -> Vec<Value> {
    let mut payloads = Vec::new();
    let mut data = String::new();

    let mut flush = |data: &mut String| {
        if !data.is_empty() {
            if let Ok(value) = serde_json::from_str::<Value>(data.trim()) {
                payloads.push(value);
            }
            data.clear();
        }
    };

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            flush(&mut data);
        } else if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        }
        // `event:`, `id:`, `retry:` and comments carry nothing we need.
    }
    flush(&mut data);
    payloads
}

fn multipart_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        key.eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

/// Parses a `multipart/mixed` body. The first section with a `data` key is canonical;
/// sections that fail to parse are skipped.
fn decode_multipart(
    status: u16,
    content_type: &str,
    body: &str,
) -> Result<RawProviderResponse, DecodeFailure> {
    let boundary = multipart_boundary(content_type).or_else(|| {
        body.trim_start()
            .lines()
            .next()
            .and_then(|line| line.strip_prefix("--"))
            .map(|b| b.trim().to_string())
    });
    let Some(boundary) = boundary.filter(|b| !b.is_empty()) else {
        return Err(DecodeFailure::new(DecodeFailureKind::Malformed, status, body));
    };

    let delimiter = format!("--{boundary}");
    let sections: Vec<Value> = body
        .split(delimiter.as_str())
        .filter_map(|section| {
            let start = section.find('{')?;
            let end = section.rfind('}')?;
            (end >= start)
                .then(|| serde_json::from_str::<Value>(&section[start..=end]).ok())
                .flatten()
        })
        .collect();

    let canonical = sections.iter().find(|section| section.get("data").is_some());
    match canonical {
        Some(document) => single_document(Transport::Multipart, status, body, document.clone()),
        None => Err(DecodeFailure::new(DecodeFailureKind::Malformed, status, body)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaKind;

    const MULTIPART_BODY: &str = "\r\n--graphql\r\ncontent-type: application/json\r\n\r\n{\"data\":{\"xfb_imagine_send_message\":{\"messages\":{\"edges\":[{\"node\":{\"content\":{\"imagine_media\":{\"images\":{\"nodes\":[{\"id\":\"42\",\"uri\":null}]}}}}}]}}}}\r\n--graphql\r\ncontent-type: application/json\r\n\r\n{\"incremental\":[],\"hasNext\":false}\r\n--graphql--\r\n";

    const EVENT_STREAM: &str = "event: message\ndata: {\"type\":\"media_generated\",\"mediaIds\":[\"1\",\"2\"],\"conversationId\":\"conv-9\"}\n\nevent: message\ndata: {\"type\":\"media_generated\",\"mediaIds\":[\"2\",\"3\"]}\n\nevent: done\ndata: {\"streaming_state\":\"OVERALL_DONE\"}\n\ndata: [DONE]\n\n";

    #[test]
    fn multipart_uses_first_section_with_data() {
        let decoded =
            decode(200, Some("multipart/mixed; boundary=\"graphql\""), MULTIPART_BODY).unwrap();
        assert_eq!(decoded.transport, Transport::Multipart);
        assert_eq!(decoded.placeholders.len(), 1);
        assert_eq!(decoded.placeholders[0].id, "42");
        assert!(!decoded.placeholders[0].is_resolved());
        assert_eq!(decoded.strategy, Some("send_message_edges"));
    }

    #[test]
    fn multipart_skips_garbage_sections() {
        let body = "--b\r\n\r\n{not json}\r\n--b\r\n\r\n{\"data\":{\"xfb_imagine_send_message\":{\"messages\":{\"edges\":[]}}}}\r\n--b--";
        let decoded = decode(200, Some("multipart/mixed; boundary=b"), body).unwrap();
        assert!(decoded.placeholders.is_empty());
    }

    #[test]
    fn event_stream_is_folded_and_idempotent() {
        let first = decode(200, Some("text/event-stream"), EVENT_STREAM).unwrap();
        let second = decode(200, Some("text/event-stream"), EVENT_STREAM).unwrap();
        assert_eq!(first, second);

        let ids: Vec<_> = first.placeholders.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert!(first.placeholders.iter().all(|p| p.kind == MediaKind::Video));
        assert_eq!(first.conversation_id.as_deref(), Some("conv-9"));
        assert_eq!(first.streaming_state.as_deref(), Some("OVERALL_DONE"));
    }

    #[test]
    fn event_stream_is_sniffed_without_content_type() {
        let decoded = decode(200, None, EVENT_STREAM).unwrap();
        assert_eq!(decoded.transport, Transport::EventStream);
    }

    #[test]
    fn newline_delimited_json_is_folded() {
        let body = concat!(
            "{\"data\":{\"node\":{\"bot_response_message\":{\"id\":\"c_1_2\",\"streaming_state\":\"STREAMING\",\"composed_text\":{\"content\":[{\"text\":\"Hel\"}]}}}}}\n",
            "{\"data\":{\"node\":{\"bot_response_message\":{\"id\":\"c_1_2\",\"streaming_state\":\"OVERALL_DONE\",\"composed_text\":{\"content\":[{\"text\":\"Hello\"}]}}}}}\n"
        );
        let decoded = decode(200, Some("application/json"), body).unwrap();
        assert_eq!(decoded.text.as_deref(), Some("Hello"));
        assert_eq!(decoded.streaming_state.as_deref(), Some("OVERALL_DONE"));
        assert_eq!(decoded.conversation_id.as_deref(), Some("c"));
    }

    #[test]
    fn error_status_and_empty_body_are_values() {
        let failure = decode(502, Some("text/html"), "<html>Bad gateway</html>").unwrap_err();
        assert_eq!(failure.kind, DecodeFailureKind::HttpStatus);
        assert_eq!(failure.status, 502);
        assert!(failure.is_retryable());

        let failure = decode(200, Some("application/json"), "   ").unwrap_err();
        assert_eq!(failure.kind, DecodeFailureKind::EmptyBody);
    }

    #[test]
    fn malformed_json_is_reported() {
        let failure = decode(200, Some("application/json"), "<html>oops</html>").unwrap_err();
        assert_eq!(failure.kind, DecodeFailureKind::Malformed);
        assert!(!failure.is_retryable());
    }

    #[test]
    fn graphql_errors_without_data_fail() {
        let body = r#"{"errors":[{"message":"Rate limit"}],"data":null}"#;
        let failure = decode(200, Some("application/json"), body).unwrap_err();
        assert_eq!(failure.kind, DecodeFailureKind::GraphQl);
        assert_eq!(failure.excerpt, "Rate limit");
    }

    #[test]
    fn excerpt_is_truncated_on_char_boundary() {
        let long = "é".repeat(800);
        let cut = excerpt(&long);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), EXCERPT_LIMIT + 3);
    }
}
