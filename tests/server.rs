mod common;

use axum::http::StatusCode;
use axum_test::TestServer;
use common::*;
use metaai::{
    create_router, AppState, Backoff, MetaAiClient, PollPolicy, ResolutionPolicy, ServerConfig,
};
use std::time::Instant;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::{MockServer, ResponseTemplate};

const IMAGE_URL: &str = "https://scontent.xx.fbcdn.net/v/t39/lighthouse.jpg";
const VIDEO_URL: &str = "https://video.xx.fbcdn.net/v/t66/lighthouse.mp4";

fn test_server(provider: &MockServer, request_timeout: Duration) -> TestServer {
    serve(client_for(provider), request_timeout)
}

fn serve(client: MetaAiClient, request_timeout: Duration) -> TestServer {
    let config = ServerConfig {
        request_timeout,
        ..ServerConfig::default()
    };
    let state = Arc::new(AppState::new(client, &config));
    TestServer::new(create_router(state)).expect("Failed to create test server")
}

fn video_generation(url: &str) -> Value {
    json!({
        "data": {
            "xfb_imagine_send_message": {
                "conversation": { "id": CONVERSATION_ID },
                "messages": { "edges": [
                    { "node": { "content": { "imagine_video": { "videos": { "nodes": [
                        { "id": "v-9", "video_url": url }
                    ] } } } } }
                ] }
            }
        }
    })
}

#[tokio::test]
async fn test_healthz() {
    let provider = MockServer::start().await;
    let server = test_server(&provider, Duration::from_secs(5));

    let response = server.get("/healthz").await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>(), json!({ "status": "ok" }));
}

#[tokio::test]
async fn test_image_endpoint_returns_urls() {
    let provider = MockServer::start().await;
    mount_generation(
        &provider,
        ResponseTemplate::new(200)
            .set_body_json(generation_response(vec![image_node("1", Some(IMAGE_URL))])),
    )
    .await;
    let server = test_server(&provider, Duration::from_secs(5));

    let response = server
        .post("/image")
        .json(&json!({ "prompt": "a lighthouse", "orientation": "horizontal" }))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["prompt"], "a lighthouse");
    assert_eq!(body["orientation"], "LANDSCAPE");
    assert_eq!(body["image_urls"], json!([IMAGE_URL]));
    assert_eq!(body["conversation_id"], CONVERSATION_ID);
    assert_eq!(body["media"][0]["id"], "1");
}

#[tokio::test]
async fn test_image_endpoint_validates_input() {
    let provider = MockServer::start().await;
    let server = test_server(&provider, Duration::from_secs(5));

    let response = server.post("/image").json(&json!({ "prompt": "" })).await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["success"], false);

    let response = server
        .post("/image")
        .json(&json!({ "prompt": "a lighthouse", "orientation": "diagonal" }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert!(provider.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_bodies_get_json_errors() {
    let provider = MockServer::start().await;
    let server = test_server(&provider, Duration::from_secs(5));

    let response = server.post("/image").json(&json!({})).await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("prompt"));
    assert_eq!(body["detail"], "Invalid request");

    let response = server.post("/video/async").json(&json!({ "prompt": 7 })).await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["success"], false);

    let response = server.post("/upload").json(&json!({ "file": "x" })).await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["success"], false);

    assert!(provider.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_image_endpoint_reports_unresolved_media_as_failure() {
    let provider = MockServer::start().await;
    mount_generation(
        &provider,
        ResponseTemplate::new(200).set_body_json(generation_response(vec![image_node("1", None)])),
    )
    .await;
    mount_media_fetch(
        &provider,
        ResponseTemplate::new(200).set_body_json(media_feed(vec![image_node("1", None)])),
    )
    .await;
    let server = test_server(&provider, Duration::from_secs(5));

    let response = server.post("/image").json(&json!({ "prompt": "a lighthouse" })).await;

    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json();
    assert_eq!(body["success"], false);
    assert_eq!(body["detail"], "Image generation failed");
    assert!(body["error"].as_str().unwrap().contains("no image URLs"));
}

#[tokio::test]
async fn test_image_endpoint_times_out() {
    let provider = MockServer::start().await;
    mount_generation(
        &provider,
        ResponseTemplate::new(200)
            .set_body_json(generation_response(vec![image_node("1", Some(IMAGE_URL))]))
            .set_delay(Duration::from_millis(500)),
    )
    .await;
    let server = test_server(&provider, Duration::from_millis(50));

    let response = server.post("/image").json(&json!({ "prompt": "a lighthouse" })).await;

    response.assert_status(StatusCode::GATEWAY_TIMEOUT);
    let body: Value = response.json();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Image generation timeout");
}

#[tokio::test]
async fn test_video_endpoint_returns_urls() {
    let provider = MockServer::start().await;
    mount_generation(
        &provider,
        ResponseTemplate::new(200).set_body_json(video_generation(VIDEO_URL)),
    )
    .await;
    let server = test_server(&provider, Duration::from_secs(5));

    let response = server
        .post("/video")
        .json(&json!({ "prompt": "a lighthouse", "max_attempts": 3 }))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["video_urls"], json!([VIDEO_URL]));
}

#[tokio::test]
async fn test_async_video_job_lifecycle() {
    let provider = MockServer::start().await;
    mount_generation(
        &provider,
        ResponseTemplate::new(200)
            .set_body_json(video_generation(VIDEO_URL))
            .set_delay(Duration::from_millis(50)),
    )
    .await;
    let server = test_server(&provider, Duration::from_secs(5));

    let response = server
        .post("/video/async")
        .json(&json!({ "prompt": "a lighthouse" }))
        .await;
    response.assert_status_ok();
    let accepted: Value = response.json();
    assert_eq!(accepted["status"], "pending");
    let job_id = accepted["job_id"].as_str().unwrap().to_string();

    let mut job = Value::Null;
    for _ in 0..100 {
        let response = server.get(&format!("/video/jobs/{job_id}")).await;
        response.assert_status_ok();
        job = response.json();
        if job["status"] == "succeeded" || job["status"] == "failed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(job["status"], "succeeded");
    assert_eq!(job["job_id"], job_id.as_str());
    assert_eq!(job["result"]["media"][0]["url"], VIDEO_URL);
    assert!(job["error"].is_null());
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let provider = MockServer::start().await;
    let server = test_server(&provider, Duration::from_secs(5));

    let response = server.get("/video/jobs/does-not-exist").await;
    response.assert_status(StatusCode::NOT_FOUND);
    assert_eq!(response.json::<Value>()["detail"], "Job not found");
}

#[tokio::test]
async fn test_image_round_trip_through_polling() {
    let provider = MockServer::start().await;
    mount_generation(
        &provider,
        ResponseTemplate::new(200).set_body_json(generation_response(vec![image_node("42", None)])),
    )
    .await;
    mount_media_fetch(
        &provider,
        Sequence::new(vec![
            ResponseTemplate::new(200).set_body_json(media_feed(vec![image_node("42", None)])),
            ResponseTemplate::new(200)
                .set_body_json(media_feed(vec![image_node("42", Some(IMAGE_URL))])),
        ]),
    )
    .await;
    let one_second = PollPolicy {
        max_attempts: 5,
        initial_delay: Duration::ZERO,
        backoff: Backoff::fixed(Duration::from_secs(1)),
    };
    let client = MetaAiClient::builder()
        .credentials(credentials())
        .base_url(provider.uri())
        .image_policy(ResolutionPolicy {
            polling: one_second,
            scrape: one_second,
            scrape_after_failures: 3,
        })
        .build()
        .unwrap();
    let server = serve(client, Duration::from_secs(10));

    let started = Instant::now();
    let response = server
        .post("/image")
        .json(&json!({ "prompt": "a red ball", "orientation": "SQUARE" }))
        .await;
    let elapsed = started.elapsed();

    response.assert_status_ok();
    assert!(elapsed >= Duration::from_millis(900), "finished too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "took too long: {elapsed:?}");
    let body: Value = response.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["orientation"], "SQUARE");
    assert_eq!(body["image_urls"], json!([IMAGE_URL]));
}
