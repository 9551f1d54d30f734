mod common;

use common::*;
use metaai::{Credentials, MetaAiClient, MetaAiError, Orientation};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_landing(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(response)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_forbidden_generation_refreshes_and_reports_session_expired() {
    let server = MockServer::start().await;
    mount_generation(&server, ResponseTemplate::new(403).set_body_string("")).await;
    mount_landing(
        &server,
        ResponseTemplate::new(200)
            .insert_header("set-cookie", "abra_sess=rotated-sess; Path=/; Secure")
            .set_body_string(r#"<script>{"accessToken":"ecto1:fresh-token","user":1}</script>"#),
    )
    .await;

    let client = client_for(&server);
    let err = client
        .generate_image("a fox", Orientation::Vertical)
        .await
        .unwrap_err();

    assert!(matches!(err, MetaAiError::SessionExpired));
    assert!(err.is_transient());
    let snapshot = client.credentials().snapshot().await;
    assert_eq!(snapshot.bearer_token(), Some("ecto1:fresh-token"));
    assert_eq!(snapshot.cookie("abra_sess"), Some("rotated-sess"));
    assert_eq!(snapshot.cookie("datr"), Some("test-datr"));
}

#[tokio::test]
async fn test_failed_refresh_keeps_previous_credentials() {
    let server = MockServer::start().await;
    mount_generation(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({
            "errors": [{ "message": "Access token required" }],
            "data": null
        })),
    )
    .await;
    mount_landing(&server, ResponseTemplate::new(500)).await;

    let client = client_for(&server);
    let err = client
        .generate_image("a fox", Orientation::Vertical)
        .await
        .unwrap_err();

    assert!(matches!(err, MetaAiError::AuthRefreshFailed { .. }));
    let snapshot = client.credentials().snapshot().await;
    assert_eq!(snapshot.bearer_token(), Some("ecto1:test-token"));
    assert_eq!(snapshot.cookie("abra_sess"), Some("test-abra-sess"));
}

#[tokio::test]
async fn test_unrecoverable_auth_failure_while_polling_aborts_resolution() {
    let server = MockServer::start().await;
    mount_generation(
        &server,
        ResponseTemplate::new(200).set_body_json(generation_response(vec![image_node("42", None)])),
    )
    .await;
    mount_media_fetch(&server, ResponseTemplate::new(403)).await;
    mount_landing(&server, ResponseTemplate::new(500)).await;

    let err = client_for(&server)
        .generate_image("a fox", Orientation::Vertical)
        .await
        .unwrap_err();
    assert!(matches!(err, MetaAiError::AuthRefreshFailed { .. }));
}

#[tokio::test]
async fn test_single_forbidden_poll_is_retried_after_refresh() {
    let server = MockServer::start().await;
    mount_generation(
        &server,
        ResponseTemplate::new(200).set_body_json(generation_response(vec![image_node("42", None)])),
    )
    .await;
    mount_media_fetch(
        &server,
        Sequence::new(vec![
            ResponseTemplate::new(403),
            ResponseTemplate::new(200).set_body_json(media_feed(vec![image_node(
                "42",
                Some("https://scontent.xx.fbcdn.net/v/fox.jpg"),
            )])),
        ]),
    )
    .await;
    mount_landing(
        &server,
        ResponseTemplate::new(200).set_body_string("<html>no token</html>"),
    )
    .await;

    let result = client_for(&server)
        .generate_image("a fox", Orientation::Vertical)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.urls(), vec!["https://scontent.xx.fbcdn.net/v/fox.jpg"]);
}

#[tokio::test]
async fn test_echoed_prompt_is_not_mistaken_for_auth_failure() {
    let server = MockServer::start().await;
    let mut body = generation_response(vec![image_node(
        "42",
        Some("https://scontent.xx.fbcdn.net/v/sign.jpg"),
    )]);
    body["data"]["xfb_imagine_send_message"]["prompt"] =
        json!("Imagine an unauthorized parking sign");
    mount_generation(&server, ResponseTemplate::new(200).set_body_json(body)).await;

    let result = client_for(&server)
        .generate_image("an unauthorized parking sign", Orientation::Vertical)
        .await
        .unwrap();
    assert!(result.success);
}

#[tokio::test]
async fn test_forced_refresh_without_token_keeps_token_and_takes_rotated_cookies() {
    let server = MockServer::start().await;
    mount_landing(
        &server,
        ResponseTemplate::new(200)
            .insert_header("set-cookie", "abra_sess=rotated-sess; Path=/; Secure")
            .set_body_string("<html></html>"),
    )
    .await;

    let client = client_for(&server);
    assert!(client.refresh_credentials().await.unwrap());

    let snapshot = client.credentials().snapshot().await;
    assert_eq!(snapshot.bearer_token(), Some("ecto1:test-token"));
    assert_eq!(snapshot.cookie("abra_sess"), Some("rotated-sess"));
}

#[tokio::test]
async fn test_forced_refresh_fails_when_landing_page_errors() {
    let server = MockServer::start().await;
    mount_landing(&server, ResponseTemplate::new(500)).await;

    let client = client_for(&server);
    let err = client.refresh_credentials().await.unwrap_err();
    assert!(matches!(err, MetaAiError::RefreshFailed(_)));
    assert_eq!(err.to_string().matches("Credential refresh failed").count(), 1);
    assert_eq!(
        client.credentials().snapshot().await.cookie("abra_sess"),
        Some("test-abra-sess")
    );
}

#[tokio::test]
async fn test_missing_credentials_fail_without_network() {
    let server = MockServer::start().await;
    let result =
        MetaAiClient::new_with_url(Credentials::new().with_cookie("datr", "x"), &server.uri());

    match result {
        Err(MetaAiError::MissingCredentials { missing }) => assert_eq!(missing, vec!["abra_sess"]),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("client built without abra_sess"),
    }
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_page_fallback_fills_missing_cookies() {
    let server = MockServer::start().await;
    mount_landing(
        &server,
        ResponseTemplate::new(200)
            .insert_header("set-cookie", "datr=scraped-datr; Path=/")
            .set_body_string(
                r#"{"abra_sess":{"value":"scraped-sess"},"accessToken":"ecto1:page-token"}"#,
            ),
    )
    .await;

    let client = MetaAiClient::builder()
        .base_url(server.uri())
        .credentials(Credentials::new().with_cookie("datr", "explicit-datr"))
        .build_with_page_fallback()
        .await
        .unwrap();

    let snapshot = client.credentials().snapshot().await;
    assert_eq!(snapshot.cookie("datr"), Some("explicit-datr"));
    assert_eq!(snapshot.cookie("abra_sess"), Some("scraped-sess"));
    assert_eq!(snapshot.bearer_token(), Some("ecto1:page-token"));
}

#[tokio::test]
async fn test_refresh_writes_rotated_credentials_to_cache() {
    let server = MockServer::start().await;
    mount_landing(
        &server,
        ResponseTemplate::new(200)
            .insert_header("set-cookie", "abra_sess=rotated-sess; Path=/")
            .set_body_string(r#"{"accessToken":"ecto1:cached-token"}"#),
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("credentials.json");

    let client = MetaAiClient::builder()
        .credentials(credentials())
        .base_url(server.uri())
        .cache_path(Some(cache.clone()))
        .build()
        .unwrap();
    assert!(client.refresh_credentials().await.unwrap());

    let cached = Credentials::load_from(&cache).await.unwrap();
    assert_eq!(cached, client.credentials().snapshot().await);
    assert_eq!(cached.cookie("abra_sess"), Some("rotated-sess"));
    assert_eq!(cached.bearer_token(), Some("ecto1:cached-token"));
}
