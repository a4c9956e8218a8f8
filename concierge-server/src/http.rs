//! Concierge HTTP API
//!
//! Axum server exposing out-of-band context access, direct tool calls, token
//! verification and the WebSocket upgrade. Runs alongside the Unix socket
//! transport.
//!
//! Each endpoint has a thin axum handler that delegates to an inner function
//! returning `(StatusCode, Value)`; the inner functions are tested directly.
//!
//! Endpoints:
//! - GET    /health                   — liveness, connections, durable tier
//! - GET    /version                  — server version info
//! - GET    /api/context/:sessionId   — read a context
//! - POST   /api/context/:sessionId   — merge into a context
//! - DELETE /api/context/:key         — drop a context (admin)
//! - GET    /api/contexts             — list contexts (admin)
//! - GET    /api/history/:sessionId   — read history, `?limit=` for the tail
//! - POST   /api/verify-token         — HS256 token check
//! - POST   /api/tools                — run a tool for a session
//! - GET    /ws                       — WebSocket transport

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use concierge_core::ipc::ServerEvent;
use concierge_core::models::{is_valid_session_id, Context};
use concierge_core::ConciergeError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::state::ServerState;
use crate::subsystems::{auth, dispatcher, tools};
use crate::ws;

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route(
            "/api/context/:key",
            get(get_context_handler)
                .post(post_context_handler)
                .delete(delete_context_handler),
        )
        .route("/api/contexts", get(list_contexts_handler))
        .route("/api/history/:session_id", get(history_handler))
        .route("/api/verify-token", post(verify_token_handler))
        .route("/api/tools", post(tools_handler))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(state: Arc<ServerState>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);
    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Concierge HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request / Response DTOs
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct VerifyTokenRequest {
    pub token: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolRequest {
    pub tool: Option<String>,
    #[serde(default)]
    pub params: Value,
    pub session_id: Option<String>,
}

/// Standard HTTP error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            status: "error".to_string(),
        }
    }
}

fn error_body(status: StatusCode, msg: impl Into<String>) -> (StatusCode, Value) {
    (status, json!(ErrorResponse::new(msg)))
}

/// HTTP status for a failed operation.
pub fn status_for(e: &ConciergeError) -> StatusCode {
    match e.kind() {
        "invalid_input" => StatusCode::BAD_REQUEST,
        "not_found" => StatusCode::NOT_FOUND,
        "upstream_unavailable" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn check_session_id(session_id: &str) -> Option<(StatusCode, Value)> {
    if is_valid_session_id(session_id) {
        None
    } else {
        Some(error_body(StatusCode::BAD_REQUEST, "invalid session id"))
    }
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

pub async fn health_inner(state: &ServerState) -> (StatusCode, Value) {
    (
        StatusCode::OK,
        json!({
            "status": "ok",
            "timestamp": Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION"),
            "connections": state.registry.connected_count(),
            "durable": state.store.durable_status().await,
            "uptimeSeconds": (Utc::now() - state.started_at).num_seconds(),
        }),
    )
}

/// Version info; no IO.
pub fn version_inner() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "concierge/1",
    })
}

pub async fn get_context_inner(state: &ServerState, session_id: &str) -> (StatusCode, Value) {
    if let Some(err) = check_session_id(session_id) {
        return err;
    }
    let ctx = state.store.get(session_id).await;
    (StatusCode::OK, json!({ "sessionId": session_id, "context": ctx }))
}

/// Merge a partial context: `memory` and `sessionProperties` keys are merged
/// (a null memory value removes the key), `history` is replaced when present.
pub async fn post_context_inner(state: &ServerState, session_id: &str, body: Value) -> (StatusCode, Value) {
    if let Some(err) = check_session_id(session_id) {
        return err;
    }
    let Value::Object(body) = body else {
        return error_body(StatusCode::BAD_REQUEST, "body must be a JSON object");
    };

    let _guard = state.store.lock(session_id).await;
    let mut ctx = state.store.get(session_id).await;

    if let Some(memory) = body.get("memory") {
        let Some(memory) = memory.as_object() else {
            return error_body(StatusCode::BAD_REQUEST, "memory must be an object");
        };
        for (k, v) in memory {
            if v.is_null() {
                ctx.remove(k);
            } else {
                ctx.set(k.clone(), v.clone());
            }
        }
    }
    if let Some(props) = body.get("sessionProperties") {
        let Some(props) = props.as_object() else {
            return error_body(StatusCode::BAD_REQUEST, "sessionProperties must be an object");
        };
        ctx.merge_session_properties(props);
    }
    if let Some(history) = body.get("history") {
        if !history.is_array() {
            return error_body(StatusCode::BAD_REQUEST, "history must be an array");
        }
        ctx.history = Context::from_value(json!({ "history": history })).history;
    }

    let stored = state.store.put(session_id, ctx.clone()).await;
    state.registry.send(
        session_id,
        ServerEvent::Context {
            context: ctx.clone(),
        },
    );
    tracing::info!(session_id, ?stored, "Context updated over HTTP");
    (
        StatusCode::OK,
        json!({ "success": true, "stored": stored, "context": ctx }),
    )
}

pub async fn delete_context_inner(state: &ServerState, key: &str) -> (StatusCode, Value) {
    let _guard = state.store.lock(key).await;
    if state.store.delete(key).await {
        tracing::info!(key, "Context deleted");
        (StatusCode::OK, json!({ "deleted": true, "key": key }))
    } else {
        error_body(StatusCode::NOT_FOUND, format!("no context for '{key}'"))
    }
}

pub async fn list_contexts_inner(state: &ServerState) -> (StatusCode, Value) {
    let contexts = state.store.list().await;
    (
        StatusCode::OK,
        json!({ "count": contexts.len(), "contexts": contexts }),
    )
}

pub async fn history_inner(state: &ServerState, session_id: &str, limit: Option<usize>) -> (StatusCode, Value) {
    if let Some(err) = check_session_id(session_id) {
        return err;
    }
    let ctx = state.store.get(session_id).await;
    let total = ctx.history.len();
    let history = match limit {
        Some(n) => ctx.recent_turns(n).to_vec(),
        None => ctx.history,
    };
    (
        StatusCode::OK,
        json!({ "sessionId": session_id, "total": total, "history": history }),
    )
}

/// Stateless; never touches a context.
pub fn verify_token_inner(state: &ServerState, req: VerifyTokenRequest) -> (StatusCode, Value) {
    let token = match req.token {
        Some(t) if !t.trim().is_empty() => t,
        _ => return error_body(StatusCode::BAD_REQUEST, "token field is required"),
    };
    let Some(secret) = state.config.auth.resolved_secret() else {
        return error_body(StatusCode::INTERNAL_SERVER_ERROR, "token verification is not configured");
    };

    match auth::verify_token(&token, &secret, Utc::now().timestamp()) {
        Ok(claims) => (StatusCode::OK, json!({ "isValid": true, "decoded": claims })),
        Err(e) => {
            tracing::debug!(error = %e, "Token rejected");
            (StatusCode::OK, json!({ "isValid": false, "error": e.to_string() }))
        }
    }
}

pub async fn tools_inner(state: &ServerState, req: ToolRequest) -> (StatusCode, Value) {
    let tool = match req.tool {
        Some(t) if !t.trim().is_empty() => t,
        _ => return error_body(StatusCode::BAD_REQUEST, "tool field is required"),
    };
    if !tools::is_known(&tool) {
        return error_body(StatusCode::NOT_FOUND, format!("unknown tool '{tool}'"));
    }
    let session_id = match req.session_id {
        Some(s) if is_valid_session_id(&s) => s,
        _ => return error_body(StatusCode::BAD_REQUEST, "a valid sessionId is required"),
    };

    match state.engine.use_tool(&session_id, &tool, &req.params).await {
        Ok(result) => (StatusCode::OK, json!({ "success": true, "tool": tool, "result": result })),
        Err(e) => (
            status_for(&e),
            json!({
                "success": false,
                "tool": tool,
                "error": dispatcher::human_message(&e),
                "status": "error",
            }),
        ),
    }
}

// ============================================================================
// Axum handler wrappers
// ============================================================================

pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn get_context_handler(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = get_context_inner(&state, &session_id).await;
    (status, Json(body))
}

pub async fn post_context_handler(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let (status, body) = post_context_inner(&state, &session_id, body).await;
    (status, Json(body))
}

pub async fn delete_context_handler(
    State(state): State<Arc<ServerState>>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    let (status, body) = delete_context_inner(&state, &key).await;
    (status, Json(body))
}

pub async fn list_contexts_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let (status, body) = list_contexts_inner(&state).await;
    (status, Json(body))
}

pub async fn history_handler(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let (status, body) = history_inner(&state, &session_id, query.limit).await;
    (status, Json(body))
}

pub async fn verify_token_handler(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<VerifyTokenRequest>,
) -> impl IntoResponse {
    let (status, body) = verify_token_inner(&state, req);
    (status, Json(body))
}

pub async fn tools_handler(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<ToolRequest>,
) -> impl IntoResponse {
    let (status, body) = tools_inner(&state, req).await;
    (status, Json(body))
}

// ============================================================================
// Unit Tests
// ============================================================================
