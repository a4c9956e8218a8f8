//! HTTP integration tests for the Concierge API.
//!
//! Requests go through the full axum router via `oneshot`; the scheduling API
//! is a wiremock server and the completion backend is a canned stub.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use concierge_core::completion::{CompletionBackend, CompletionError, CompletionOutput};
use concierge_core::models::{ToolSpec, Turn};
use concierge_core::{ConciergeConfig, HttpSchedulingClient};
use concierge_server::http::build_router;
use concierge_server::subsystems::auth;
use concierge_server::ServerState;
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "integration-secret";

struct CannedCompletion;

#[async_trait]
impl CompletionBackend for CannedCompletion {
    async fn complete(
        &self,
        _directive: &str,
        _history: &[Turn],
        _input: Option<&str>,
        _tools: &[ToolSpec],
    ) -> Result<CompletionOutput, CompletionError> {
        Ok(CompletionOutput {
            text: "ok".into(),
            tool_calls: vec![],
        })
    }

    fn name(&self) -> &str {
        "canned"
    }
}

fn make_state(scheduling_url: &str) -> Arc<ServerState> {
    let mut config = ConciergeConfig::default();
    config.scheduling.api_key = Some("sched-key".into());
    config.scheduling.max_retries = 0;
    config.completion.api_key = Some("completion-key".into());
    config.auth.token_secret = Some(SECRET.into());

    let scheduling =
        HttpSchedulingClient::with_base_url(config.scheduling.clone(), scheduling_url.to_string()).unwrap();
    ServerState::from_parts(config, None, Arc::new(scheduling), Arc::new(CannedCompletion))
}

async fn send(state: &Arc<ServerState>, req: Request<Body>) -> (StatusCode, Value) {
    let response = build_router(state.clone()).oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// ===========================================================================
// TEST 1: GET /health liveness fields
// ===========================================================================
#[tokio::test]
async fn test_health_endpoint() {
    let server = MockServer::start().await;
    let state = make_state(&server.uri());

    let (status, body) = send(&state, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 0);
    assert_eq!(body["durable"], "disabled");
}

// ===========================================================================
// TEST 2: GET /version
// ===========================================================================
#[tokio::test]
async fn test_version_endpoint() {
    let server = MockServer::start().await;
    let state = make_state(&server.uri());

    let (status, body) = send(&state, get("/version")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["protocol"], "concierge/1");
}

// ===========================================================================
// TEST 3: POST then GET /api/context/:sessionId
// ===========================================================================
#[tokio::test]
async fn test_context_write_then_read() {
    let server = MockServer::start().await;
    let state = make_state(&server.uri());

    let (status, _) = send(
        &state,
        post(
            "/api/context/web-1",
            json!({"memory": {"preferred_date": "2026-10-20"}, "sessionProperties": {"channel": "web"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&state, get("/api/context/web-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["context"]["memory"]["preferred_date"], "2026-10-20");
    assert_eq!(body["context"]["sessionProperties"]["channel"], "web");
}

// ===========================================================================
// TEST 4: GET /api/history/:sessionId?limit=
// ===========================================================================
#[tokio::test]
async fn test_history_limit() {
    let server = MockServer::start().await;
    let state = make_state(&server.uri());
    send(
        &state,
        post(
            "/api/context/web-2",
            json!({"history": [
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": "hi there"}
            ]}),
        ),
    )
    .await;

    let (status, body) = send(&state, get("/api/history/web-2?limit=1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["history"][0]["content"], "hi there");
}

// ===========================================================================
// TEST 5: POST /api/tools runs against the scheduling API and updates context
// ===========================================================================
#[tokio::test]
async fn test_tool_call_updates_context() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/contacts"))
        .and(query_param("query", "ana"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "c1", "name": "Ana Lima"}
        ])))
        .mount(&server)
        .await;
    let state = make_state(&server.uri());

    let (status, body) = send(
        &state,
        post(
            "/api/tools",
            json!({"tool": "search_customer", "params": {"query": "ana"}, "sessionId": "web-3"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["result"]["count"], 1);

    let (_, body) = send(&state, get("/api/context/web-3")).await;
    assert_eq!(body["context"]["memory"]["user_info"]["name"], "Ana Lima");
    assert_eq!(body["context"]["memory"]["tool_counts"]["search_customer"], 1);
}

// ===========================================================================
// TEST 6: POST /api/tools error statuses
// ===========================================================================
#[tokio::test]
async fn test_tool_call_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/services"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let state = make_state(&server.uri());

    let (status, body) = send(
        &state,
        post("/api/tools", json!({"tool": "teleport", "sessionId": "web-4"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "error");

    let (status, _) = send(
        &state,
        post("/api/tools", json!({"tool": "get_customer", "params": {}, "sessionId": "web-4"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &state,
        post("/api/tools", json!({"tool": "list_services", "sessionId": "web-4"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["success"], false);
}

// ===========================================================================
// TEST 7: POST /api/verify-token
// ===========================================================================
#[tokio::test]
async fn test_verify_token_endpoint() {
    let server = MockServer::start().await;
    let state = make_state(&server.uri());
    let token = auth::sign_token(&json!({"sub": "staff-7", "role": "admin"}), SECRET).unwrap();

    let (status, body) = send(&state, post("/api/verify-token", json!({"token": token}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isValid"], true);
    assert_eq!(body["decoded"]["role"], "admin");

    let (_, body) = send(&state, post("/api/verify-token", json!({"token": "x.y.z"}))).await;
    assert_eq!(body["isValid"], false);
}

// ===========================================================================
// TEST 8: DELETE /api/context/:key and GET /api/contexts
// ===========================================================================
#[tokio::test]
async fn test_delete_and_list_contexts() {
    let server = MockServer::start().await;
    let state = make_state(&server.uri());
    send(&state, post("/api/context/web-5", json!({"memory": {"x": 1}}))).await;

    let (_, body) = send(&state, get("/api/contexts")).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["contexts"][0]["key"], "web-5");

    let req = Request::builder()
        .method("DELETE")
        .uri("/api/context/web-5")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&state, req).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&state, get("/api/contexts")).await;
    assert_eq!(body["count"], 0);
}
