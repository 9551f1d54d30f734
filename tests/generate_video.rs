mod common;

use common::*;
use metaai::{GenerationKind, MediaKind, ResolutionStrategy};
use serde_json::{json, Value};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const VIDEO_URL: &str = "https://video-lhr8-1.xx.fbcdn.net/o1/v/t2/f2/m69/wave.mp4?efg=abc";

fn video_feed(id: &str, url: Option<&str>) -> Value {
    let delivery = url.map(|url| {
        json!({ "progressive_urls": [{ "progressive_url": url, "quality": "HD" }] })
    });
    json!({
        "data": {
            "xfb_genai_fetch_post": {
                "messages": { "edges": [
                    { "node": { "content": { "imagine_video": { "videos": { "nodes": [
                        { "id": id, "videoDeliveryResponseResult": delivery }
                    ] } } } } }
                ] }
            }
        }
    })
}

#[tokio::test]
async fn test_generate_video_from_event_stream() {
    let server = MockServer::start().await;
    let stream = format!(
        "event: message\ndata: {{\"type\":\"media_generated\",\"mediaType\":\"video\",\"mediaIds\":[\"v-1\"],\"conversationId\":\"{CONVERSATION_ID}\"}}\n\ndata: [DONE]\n\n"
    );
    mount_generation(
        &server,
        ResponseTemplate::new(200).set_body_raw(stream, "text/event-stream"),
    )
    .await;
    mount_media_fetch(
        &server,
        Sequence::new(vec![
            ResponseTemplate::new(200).set_body_json(video_feed("v-1", None)),
            ResponseTemplate::new(200).set_body_json(video_feed("v-1", None)),
            ResponseTemplate::new(200).set_body_json(video_feed("v-1", Some(VIDEO_URL))),
        ]),
    )
    .await;

    let result = client_for(&server).generate_video("ocean waves at dusk").await.unwrap();

    assert!(result.success);
    assert_eq!(result.kind, GenerationKind::Video);
    assert_eq!(result.urls(), vec![VIDEO_URL]);
    assert_eq!(result.media[0].kind, MediaKind::Video);
    assert_eq!(result.strategy, ResolutionStrategy::Polling);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.conversation_id, CONVERSATION_ID);

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["variables"]["content"], "Animate ocean waves at dusk");
    assert_eq!(body["variables"]["imagineOperationRequest"]["textToImageParams"], json!({}));

    let poll: Value = serde_json::from_slice(&requests[1].body).unwrap();
    assert_eq!(poll["variables"]["mediaId"], "v-1");
}

#[tokio::test]
async fn test_text_prompt_returns_assistant_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/graphql/"))
        .and(header("x-fb-friendly-name", "useAbraSendMessageMutation"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "node": { "bot_response_message": {
                "id": "12345_67890",
                "streaming_state": "OVERALL_DONE",
                "composed_text": { "content": [{ "text": "Hello there" }] }
            } } }
        })))
        .mount(&server)
        .await;

    let result = client_for(&server).prompt_text("hi").await.unwrap();

    assert!(result.success);
    assert_eq!(result.text.as_deref(), Some("Hello there"));
    assert_eq!(result.strategy, ResolutionStrategy::None);
    assert_eq!(result.conversation_id, "12345");
}
