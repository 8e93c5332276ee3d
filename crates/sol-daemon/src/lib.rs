// SPDX-License-Identifier: MIT OR Apache-2.0
//! The HTTP control-plane: wires [`sol_runtime::Runtime`] onto Axum routes
//! matching §6 ("`POST /v1/chat`", "`GET /internal/topology`").
#![deny(unsafe_code)]

pub mod api;
pub mod middleware;

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::sse::{Event as AxumSseEvent, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use sol_runtime::{ChatRequest, Runtime, SseEvent};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use api::{ChatRequestBody, ChatResponse, TopologyResponse};

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
    pub internal_token: Option<String>,
    pub db_path: String,
}

/// Build the Axum router with all daemon routes (§6).
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(cmd_health))
        .route("/v1/chat", post(cmd_chat))
        .route("/v1/chat/stream", get(cmd_chat_stream))
        .route("/internal/topology", get(cmd_topology))
        .with_state(state)
}

async fn cmd_health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "time": chrono::Utc::now().to_rfc3339() }))
}

async fn cmd_chat(State(state): State<Arc<AppState>>, Json(body): Json<ChatRequestBody>) -> Response {
    let request = ChatRequest { packet: body.packet, client_request_id: body.client_request_id, forced_persona: body.forced_persona };
    let outcome = state.runtime.handle_chat(request).await;
    match ChatResponse::from(outcome) {
        ChatResponse::Ok(status, body) => (StatusCode::from_u16(status).unwrap(), Json(body)).into_response(),
        ChatResponse::Accepted(status, body) => (StatusCode::from_u16(status).unwrap(), Json(body)).into_response(),
        ChatResponse::InvalidRequest(status, body) => (StatusCode::from_u16(status).unwrap(), Json(body)).into_response(),
        ChatResponse::GateFailure(status, body) => (StatusCode::from_u16(status).unwrap(), Json(body)).into_response(),
        ChatResponse::ServerError(status, body) => (StatusCode::from_u16(status).unwrap(), Json(body)).into_response(),
    }
}

/// SSE stream of lifecycle events (`run_started`, `assistant_final_ready`,
/// `assistant_failed`) for every transmission, per the user stream in §6.
async fn cmd_chat_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<AxumSseEvent, Infallible>>> {
    let stream = BroadcastStream::new(state.runtime.subscribe()).filter_map(|item| {
        let (transmission_id, event) = item.ok()?;
        let payload = serde_json::to_value(&event).ok()?;
        let name = match event {
            SseEvent::RunStarted { .. } => "run_started",
            SseEvent::AssistantFinalReady { .. } => "assistant_final_ready",
            SseEvent::AssistantFailed { .. } => "assistant_failed",
        };
        let data = json!({ "transmission_id": transmission_id, "payload": payload }).to_string();
        Some(Ok(AxumSseEvent::default().event(name).data(data)))
    });
    Sse::new(stream)
}

async fn cmd_topology(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(expected) = state.internal_token.as_deref() else {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "internal token not configured" }))).into_response();
    };
    let Some(provided) = headers.get("x-sol-internal-token").and_then(|v| v.to_str().ok()) else {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "missing x-sol-internal-token" }))).into_response();
    };
    if provided != expected {
        return (StatusCode::FORBIDDEN, Json(json!({ "error": "invalid internal token" }))).into_response();
    }

    match state.runtime.store.ensure_topology_key_primary(&state.db_path).await {
        Ok(key) => {
            info!(topology_key = %key.topology_key, "topology key resolved");
            (
                StatusCode::OK,
                Json(TopologyResponse {
                    topology_key: key.topology_key,
                    created_at_ms: key.created_at_ms,
                    created_by: key.created_by,
                    db_path: key.db_path,
                }),
            )
                .into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response(),
    }
}
