// SPDX-License-Identifier: MIT OR Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use sol_core::PacketInput;
use sol_daemon::{AppState, build_app};
use sol_runtime::{FakeProvider, InMemoryStore, Runtime};
use tower::ServiceExt;

fn test_packet(message: &str) -> PacketInput {
    PacketInput {
        thread_id: "thread-1".into(),
        packet_type: "chat".into(),
        message: message.into(),
        evidence: None,
        thread_memento_ref: None,
        thread_memento_inline: None,
        provider_hint: None,
        requested_notification_policy: None,
        trace_capture_model_io: None,
        thread_context_mode: Default::default(),
        force_evidence: None,
        simulate: None,
        user_id: None,
    }
}

fn test_state(internal_token: Option<&str>) -> Arc<AppState> {
    let (config, _warnings) = sol_config::RuntimeConfig::from_map(&HashMap::new()).unwrap();
    let store = Arc::new(InMemoryStore::new());
    let provider = Arc::new(FakeProvider::new());
    let runtime = Arc::new(Runtime::new(store, provider, config));
    Arc::new(AppState {
        runtime,
        internal_token: internal_token.map(str::to_string),
        db_path: "test.db".into(),
    })
}

#[tokio::test]
async fn health_returns_ok() {
    let app = build_app(test_state(None));

    let resp = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn chat_with_fake_provider_returns_ok() {
    let app = build_app(test_state(None));

    let req_body = serde_json::to_vec(&test_packet("hello there")).unwrap();
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat")
                .header("content-type", "application/json")
                .body(Body::from(req_body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["ok"], true);
    assert!(json["assistant"].as_str().unwrap_or_default().len() > 0);
}

#[tokio::test]
async fn chat_simulate_returns_accepted() {
    let app = build_app(test_state(None));

    let mut packet = test_packet("queue this");
    packet.simulate = Some(true);

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&packet).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["ok"], true);
    assert_eq!(json["status"], "created");
}

#[tokio::test]
async fn chat_invalid_json_returns_client_error() {
    let app = build_app(test_state(None));

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat")
                .header("content-type", "application/json")
                .body(Body::from("not valid json"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(resp.status().is_client_error(), "expected 4xx, got {}", resp.status());
}

#[tokio::test]
async fn topology_without_token_configured_is_unauthorized() {
    let app = build_app(test_state(None));

    let resp = app
        .oneshot(Request::builder().uri("/internal/topology").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn topology_with_wrong_token_is_forbidden() {
    let app = build_app(test_state(Some("secret")));

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/internal/topology")
                .header("x-sol-internal-token", "wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn topology_with_correct_token_returns_ok() {
    let app = build_app(test_state(Some("secret")));

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/internal/topology")
                .header("x-sol-internal-token", "secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(json.get("topology_key").is_some());
}

#[tokio::test]
async fn chat_with_forced_persona_reports_reason_over_http() {
    let app = build_app(test_state(None));

    let mut packet = test_packet("hello there");
    let req_body = serde_json::to_vec(&serde_json::json!({
        "thread_id": packet.thread_id,
        "packet_type": packet.packet_type,
        "message": std::mem::take(&mut packet.message),
        "forced_persona": "diogenes",
    }))
    .unwrap();
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat")
                .header("content-type", "application/json")
                .body(Body::from(req_body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["mode_decision"]["mode_label"], "System-mode");
    assert_eq!(json["mode_decision"]["persona_label"], "diogenes");
    assert!(json["mode_decision"]["reasons"].as_array().unwrap().iter().any(|r| r == "forced_persona"));
}

#[tokio::test]
async fn chat_stream_returns_sse_content_type() {
    let app = build_app(test_state(None));

    let resp = app
        .oneshot(Request::builder().uri("/v1/chat/stream").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let ct = resp.headers().get("content-type").unwrap().to_str().unwrap();
    assert!(ct.contains("text/event-stream"), "expected SSE content type, got: {ct}");
}
