#![allow(dead_code)]

use metaai::{
    Backoff, Credentials, MetaAiClient, PollPolicy, ResolutionPolicy, UploadPolicy,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Respond, ResponseTemplate};

pub use metaai::request::GENERATION_DOC_ID;
pub const CONVERSATION_ID: &str = "c0ffee00-1111-2222-3333-444455556666";

pub fn credentials() -> Credentials {
    Credentials::from_mandatory("test-datr", "test-abra-sess").with_bearer_token("ecto1:test-token")
}

fn quick(max_attempts: u32) -> PollPolicy {
    PollPolicy {
        max_attempts,
        initial_delay: Duration::ZERO,
        backoff: Backoff::fixed(Duration::from_millis(10)),
    }
}

pub fn quick_resolution() -> ResolutionPolicy {
    ResolutionPolicy {
        polling: quick(5),
        scrape: quick(2),
        scrape_after_failures: 3,
    }
}

/// A client pointed at `server` with millisecond backoffs.
pub fn client_for(server: &MockServer) -> MetaAiClient {
    MetaAiClient::builder()
        .credentials(credentials())
        .base_url(server.uri())
        .upload_url(server.uri())
        .image_policy(quick_resolution())
        .video_policy(quick_resolution())
        .upload_policy(UploadPolicy {
            max_attempts: 3,
            backoff: Backoff::fixed(Duration::from_millis(10)),
        })
        .build()
        .unwrap()
}

pub fn image_node(id: &str, uri: Option<&str>) -> Value {
    json!({ "id": id, "uri": uri, "width": 1024, "height": 1024 })
}

/// The create mutation's answer: image placeholders inside the sent message.
pub fn generation_response(nodes: Vec<Value>) -> Value {
    json!({
        "data": {
            "xfb_imagine_send_message": {
                "conversation": { "id": CONVERSATION_ID },
                "messages": { "edges": [
                    { "node": { "content": { "imagine_media": { "images": { "nodes": nodes } } } } }
                ] }
            }
        }
    })
}

/// The media query's answer: a feed of the requester's recent images.
pub fn media_feed(nodes: Vec<Value>) -> Value {
    json!({
        "data": {
            "xfb_genai_fetch_post": {
                "messages": { "edges": [
                    { "node": { "content": { "imagine_media": { "images": { "nodes": nodes } } } } }
                ] }
            }
        }
    })
}

pub async fn mount_generation(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/api/graphql/"))
        .and(body_partial_json(json!({ "doc_id": GENERATION_DOC_ID })))
        .respond_with(response)
        .mount(server)
        .await;
}

pub async fn mount_media_fetch<R: Respond + 'static>(server: &MockServer, responder: R) {
    Mock::given(method("POST"))
        .and(path("/api/graphql/"))
        .and(header("x-fb-friendly-name", "KadabraPromptRootQuery"))
        .respond_with(responder)
        .mount(server)
        .await;
}

/// Serves the responses in order, repeating the last one.
pub struct Sequence {
    responses: Vec<ResponseTemplate>,
    calls: AtomicUsize,
}

impl Sequence {
    pub fn new(responses: Vec<ResponseTemplate>) -> Self {
        Self {
            responses,
            calls: AtomicUsize::new(0),
        }
    }
}

impl Respond for Sequence {
    fn respond(&self, _request: &wiremock::Request) -> ResponseTemplate {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let index = call.min(self.responses.len() - 1);
        self.responses[index].clone()
    }
}
