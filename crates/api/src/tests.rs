use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::header::CONTENT_TYPE;
use axum::http::{Request, StatusCode};
use futures_util::StreamExt;
use huddle_domain::idempotency::InMemoryIdempotencyStore;
use huddle_domain::memory_store::InMemoryDocumentStore;
use huddle_domain::util::now_ms;
use huddle_infra::config::AppConfig;
use jsonwebtoken::{EncodingKey, Header, encode};
use serde::Serialize;
use serde_json::{Value, json};
use tower::ServiceExt;

use crate::observability;
use crate::routes;
use crate::state::AppState;

const ALICE: &str = "user-alice";
const BOBBY: &str = "user-bobby";
const CAROL: &str = "user-carol";

#[derive(Serialize)]
struct Claims {
    sub: String,
    email: String,
    email_verified: bool,
    exp: usize,
}

fn test_config() -> AppConfig {
    AppConfig {
        app_env: "test".to_string(),
        port: 0,
        log_level: "info".to_string(),
        data_backend: "memory".to_string(),
        idempotency_backend: "memory".to_string(),
        redis_url: "redis://127.0.0.1:6379".to_string(),
        idempotency_prefix: "huddle:test".to_string(),
        idempotency_in_progress_ttl_secs: 60,
        idempotency_completed_ttl_secs: 600,
        jwt_secret: "test-secret".to_string(),
        request_timeout_secs: 5,
        chat_read_receipt_window: 50,
        chat_delete_batch_size: 400,
        chat_min_user_id_len: 8,
    }
}

fn test_token(sub: &str) -> String {
    let now = (now_ms() / 1_000) as u64;
    let claims = Claims {
        sub: sub.to_string(),
        email: format!("{sub}@example.com"),
        email_verified: true,
        exp: (now + 3600) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"test-secret"),
    )
    .expect("token")
}

fn test_app() -> axum::Router {
    let state = AppState::with_stores(
        test_config(),
        Arc::new(InMemoryDocumentStore::new()),
        Arc::new(InMemoryIdempotencyStore::new("test")),
    );
    routes::router(state)
}

async fn call(
    app: &axum::Router,
    method: &str,
    uri: &str,
    user: Option<&str>,
    request_id: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("authorization", format!("Bearer {}", test_token(user)));
    }
    if let Some(request_id) = request_id {
        builder = builder.header("x-request-id", request_id);
    }
    let request = match body {
        Some(body) => builder
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("request");

    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json")
    };
    (status, value)
}

async fn create_profile(app: &axum::Router, user: &str, name: &str) {
    let (status, _) = call(
        app,
        "PUT",
        "/v1/profile",
        Some(user),
        None,
        Some(json!({ "name": name, "username": name.to_lowercase() })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

async fn follow_each_other(app: &axum::Router, a: &str, b: &str) {
    for (follower, followee) in [(a, b), (b, a)] {
        let (status, _) = call(
            app,
            "POST",
            &format!("/v1/profiles/{followee}/follow"),
            Some(follower),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
}

fn str_field<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing {pointer} in {value}"))
}

#[tokio::test]
async fn health_is_public_and_chat_routes_require_a_token() {
    let app = test_app();

    let (status, body) = call(&app, "GET", "/health", None, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = call(&app, "GET", "/v1/inbox", None, None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");
}

#[tokio::test]
async fn token_signed_with_another_secret_is_rejected() {
    let app = test_app();
    let now = (now_ms() / 1_000) as u64;
    let forged = encode(
        &Header::default(),
        &Claims {
            sub: ALICE.to_string(),
            email: "alice@example.com".to_string(),
            email_verified: true,
            exp: (now + 3600) as usize,
        },
        &EncodingKey::from_secret(b"not-the-secret"),
    )
    .expect("token");
    let request = Request::builder()
        .uri("/v1/inbox")
        .header("authorization", format!("Bearer {forged}"))
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn message_request_lifecycle_over_http() {
    let app = test_app();
    create_profile(&app, ALICE, "Alice").await;
    create_profile(&app, BOBBY, "Bobby").await;

    let (status, sent) = call(
        &app,
        "POST",
        "/v1/message-requests",
        Some(ALICE),
        Some("req-hi"),
        Some(json!({ "recipient_id": BOBBY, "message": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(sent["outcome"], "created");
    let request_id = str_field(&sent, "/request/requestId").to_string();

    let (status, received) =
        call(&app, "GET", "/v1/message-requests/received", Some(BOBBY), None, None).await;
    assert_eq!(status, StatusCode::OK);
    let received = received.as_array().expect("array");
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["counterpart"]["name"], "Alice");

    let (status, _) = call(
        &app,
        "POST",
        &format!("/v1/message-requests/{request_id}/accept"),
        Some(ALICE),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, accepted) = call(
        &app,
        "POST",
        &format!("/v1/message-requests/{request_id}/accept"),
        Some(BOBBY),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(accepted["request"]["status"], "accepted");
    let chat_id = str_field(&accepted, "/chat/chatId").to_string();
    assert_eq!(chat_id, "user-alice_user-bobby");

    let (status, page) = call(
        &app,
        "GET",
        &format!("/v1/chats/{chat_id}/messages"),
        Some(BOBBY),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let messages = page["messages"].as_array().expect("messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["text"], "hi");
    assert_eq!(messages[0]["senderId"], ALICE);

    let (status, body) = call(
        &app,
        "POST",
        &format!("/v1/message-requests/{request_id}/reject"),
        Some(BOBBY),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "already_resolved");
}

#[tokio::test]
async fn mutual_followers_open_a_chat_and_message_sends_replay() {
    let app = test_app();
    create_profile(&app, ALICE, "Alice").await;
    create_profile(&app, BOBBY, "Bobby").await;
    follow_each_other(&app, ALICE, BOBBY).await;

    let (status, relationship) = call(
        &app,
        "GET",
        &format!("/v1/profiles/{BOBBY}/relationship"),
        Some(ALICE),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(relationship["mutual"], true);

    let (status, start) = call(
        &app,
        "POST",
        "/v1/conversations",
        Some(ALICE),
        Some("start-1"),
        Some(json!({ "recipient_id": BOBBY, "text": "hey" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(start["path"], "opened");
    let chat_id = str_field(&start, "/chat/chatId").to_string();

    let send_uri = format!("/v1/chats/{chat_id}/messages");
    let send = || {
        call(
            &app,
            "POST",
            &send_uri,
            Some(ALICE),
            Some("msg-1"),
            Some(json!({ "text": "are you around?" })),
        )
    };
    let (first_status, first) = send().await;
    let (second_status, second) = send().await;
    assert_eq!(first_status, StatusCode::CREATED);
    assert_eq!(second_status, StatusCode::CREATED);
    assert_eq!(first["messageId"], second["messageId"]);

    let (_, page) = call(
        &app,
        "GET",
        &format!("/v1/chats/{chat_id}/messages"),
        Some(BOBBY),
        None,
        None,
    )
    .await;
    assert_eq!(page["messages"].as_array().expect("messages").len(), 2);

    let (_, unread) = call(&app, "GET", "/v1/inbox/unread", Some(BOBBY), None, None).await;
    assert_eq!(unread["unread"], 2);

    let (status, receipt) = call(
        &app,
        "POST",
        &format!("/v1/chats/{chat_id}/read"),
        Some(BOBBY),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["stamped_messages"], 2);

    let (_, unread) = call(&app, "GET", "/v1/inbox/unread", Some(BOBBY), None, None).await;
    assert_eq!(unread["unread"], 0);
}

#[tokio::test]
async fn group_chat_is_limited_to_its_members() {
    let app = test_app();
    create_profile(&app, ALICE, "Alice").await;
    create_profile(&app, BOBBY, "Bobby").await;

    let (status, chat) = call(
        &app,
        "POST",
        "/v1/chats/groups",
        Some(ALICE),
        Some("group-1"),
        Some(json!({ "name": "Weekend build", "member_ids": [BOBBY] })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(chat["type"], "group");
    assert_eq!(chat["participantsInfo"][ALICE]["role"], "admin");
    let chat_id = str_field(&chat, "/chatId").to_string();

    let (status, inbox) = call(&app, "GET", "/v1/inbox", Some(BOBBY), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(inbox[0]["chat"]["chatId"], chat_id.as_str());

    let (status, body) = call(
        &app,
        "GET",
        &format!("/v1/chats/{chat_id}"),
        Some(CAROL),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "forbidden");

    let repair_uri = format!("/v1/chats/{chat_id}/repair");
    let (status, _) = call(&app, "POST", &repair_uri, Some(CAROL), None, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, repaired) = call(&app, "POST", &repair_uri, Some(BOBBY), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(repaired["reconstructed"], false);

    let (status, _) = call(
        &app,
        "POST",
        &format!("/v1/chats/{chat_id}/members"),
        Some(BOBBY),
        None,
        Some(json!({ "member_ids": [CAROL] })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, chat) = call(
        &app,
        "POST",
        &format!("/v1/chats/{chat_id}/members"),
        Some(ALICE),
        None,
        Some(json!({ "member_ids": [CAROL] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(chat["participants"].as_array().expect("participants").len(), 3);
}

#[tokio::test]
async fn invalid_payloads_are_rejected_with_validation_envelope() {
    let app = test_app();

    let (status, body) = call(
        &app,
        "POST",
        "/v1/chats/groups",
        Some(ALICE),
        Some("group-empty"),
        Some(json!({ "name": "", "member_ids": [BOBBY] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");

    let (status, _) = call(
        &app,
        "POST",
        "/v1/message-requests",
        Some(ALICE),
        Some("self-request"),
        Some(json!({ "recipient_id": ALICE, "message": "me" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // The failed attempt released its key, so a corrected retry goes through.
    let (status, _) = call(
        &app,
        "POST",
        "/v1/message-requests",
        Some(ALICE),
        Some("self-request"),
        Some(json!({ "recipient_id": BOBBY, "message": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn message_stream_starts_with_current_snapshot() {
    let app = test_app();
    follow_each_other(&app, ALICE, BOBBY).await;
    let (_, start) = call(
        &app,
        "POST",
        "/v1/conversations",
        Some(ALICE),
        Some("start-stream"),
        Some(json!({ "recipient_id": BOBBY, "text": "first" })),
    )
    .await;
    let chat_id = str_field(&start, "/chat/chatId").to_string();

    let request = Request::builder()
        .uri(format!("/v1/chats/{chat_id}/messages/stream"))
        .header("authorization", format!("Bearer {}", test_token(BOBBY)))
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"))
    );

    let mut frames = response.into_body().into_data_stream();
    let frame = frames.next().await.expect("frame").expect("bytes");
    let frame = String::from_utf8(frame.to_vec()).expect("utf8");
    assert!(frame.contains("event: messages"));
    assert!(frame.contains("\"text\":\"first\""));
}

#[tokio::test]
async fn project_acceptance_creates_the_group_chat() {
    let app = test_app();

    let (status, project) = call(
        &app,
        "POST",
        "/v1/projects",
        Some(ALICE),
        None,
        Some(json!({ "title": "Huddle", "tech": ["rust"] })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let project_id = str_field(&project, "/projectId").to_string();

    let (status, _) = call(
        &app,
        "POST",
        &format!("/v1/projects/{project_id}/invites"),
        Some(ALICE),
        None,
        Some(json!({ "user_id": BOBBY })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, project) = call(
        &app,
        "POST",
        &format!("/v1/projects/{project_id}/accept"),
        Some(BOBBY),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(project["status"], "active");
    let chat_id = str_field(&project, "/chatId").to_string();

    let (status, chat) = call(
        &app,
        "GET",
        &format!("/v1/chats/{chat_id}"),
        Some(BOBBY),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(chat["type"], "group");
}

#[tokio::test]
async fn metrics_endpoint_is_exposed() {
    let _ = observability::init_metrics();
    let app = test_app();

    let (status, _) = call(&app, "GET", "/health", None, None, None).await;
    assert_eq!(status, StatusCode::OK);

    let request = Request::builder()
        .method("GET")
        .uri("/metrics")
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body = String::from_utf8(body.to_vec()).expect("metrics body");
    assert!(body.contains("huddle_api_http_requests_total"));
}
