//! Unix socket transport tests: handshake, chat round trip, resume.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use concierge_core::completion::{CompletionBackend, CompletionError, CompletionOutput};
use concierge_core::ipc::{self, ClientEvent, ServerEvent};
use concierge_core::models::{ToolSpec, Turn};
use concierge_core::{ConciergeConfig, HttpSchedulingClient};
use concierge_server::{server, ServerState};
use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

struct EchoCompletion;

#[async_trait]
impl CompletionBackend for EchoCompletion {
    async fn complete(
        &self,
        _directive: &str,
        _history: &[Turn],
        input: Option<&str>,
        _tools: &[ToolSpec],
    ) -> Result<CompletionOutput, CompletionError> {
        Ok(CompletionOutput {
            text: format!("echo: {}", input.unwrap_or("welcome")),
            tool_calls: vec![],
        })
    }

    fn name(&self) -> &str {
        "echo"
    }
}

fn make_state() -> Arc<ServerState> {
    let mut config = ConciergeConfig::default();
    config.scheduling.api_key = Some("sched-key".into());
    config.scheduling.max_retries = 0;
    config.completion.api_key = Some("completion-key".into());
    let scheduling =
        HttpSchedulingClient::with_base_url(config.scheduling.clone(), "http://127.0.0.1:9".into()).unwrap();
    ServerState::from_parts(config, None, Arc::new(scheduling), Arc::new(EchoCompletion))
}

type Client = Framed<UnixStream, LengthDelimitedCodec>;

async fn connect(path: &std::path::Path) -> Client {
    // The listener binds asynchronously; retry briefly.
    for _ in 0..50 {
        if let Ok(stream) = UnixStream::connect(path).await {
            return Framed::new(stream, LengthDelimitedCodec::builder().little_endian().new_codec());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("socket never came up at {}", path.display());
}

async fn send(client: &mut Client, event: &ClientEvent) {
    let bytes = ipc::encode_msgpack(event).unwrap();
    client.send(Bytes::from(bytes)).await.unwrap();
}

async fn recv(client: &mut Client) -> ServerEvent {
    let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for event")
        .expect("connection closed")
        .unwrap();
    ipc::decode_server_msgpack(&frame).unwrap()
}

/// Read until an event matches, returning it.
async fn recv_until(client: &mut Client, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
    loop {
        let event = recv(client).await;
        if pred(&event) {
            return event;
        }
    }
}

async fn session_id(client: &mut Client) -> String {
    match recv(client).await {
        ServerEvent::Session { session_id } => session_id,
        other => panic!("expected session event, got {other:?}"),
    }
}

// ===========================================================================
// TEST 1: hello without id mints a session; chat produces the event sequence
// ===========================================================================
#[tokio::test]
async fn test_hello_then_chat() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("concierge.sock");
    let (tx, _rx) = broadcast::channel(1);
    let state = make_state();
    let server_path = path.to_string_lossy().to_string();
    let handle = tokio::spawn({
        let state = state.clone();
        let shutdown = tx.subscribe();
        async move { server::run_unix_server(&server_path, state, shutdown).await }
    });

    let mut client = connect(&path).await;
    send(&mut client, &ClientEvent::Hello { session_id: None }).await;
    let sid = session_id(&mut client).await;
    assert!(!sid.is_empty());

    send(
        &mut client,
        &ClientEvent::Chat {
            message: "hello".into(),
            is_admin: false,
        },
    )
    .await;
    assert_eq!(recv(&mut client).await, ServerEvent::Typing { typing: true });
    match recv(&mut client).await {
        ServerEvent::Message { content, .. } => assert_eq!(content, "echo: hello"),
        other => panic!("expected message, got {other:?}"),
    }
    assert_eq!(recv(&mut client).await, ServerEvent::Typing { typing: false });
    match recv(&mut client).await {
        ServerEvent::Context { context } => assert_eq!(context.history.len(), 2),
        other => panic!("expected context, got {other:?}"),
    }

    let _ = tx.send(());
    handle.await.unwrap().unwrap();
    assert!(!path.exists(), "socket file removed on shutdown");
}

// ===========================================================================
// TEST 2: reconnecting with an issued id resumes the same context
// ===========================================================================
#[tokio::test]
async fn test_resume_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("concierge.sock");
    let (tx, _rx) = broadcast::channel(1);
    let state = make_state();
    let server_path = path.to_string_lossy().to_string();
    tokio::spawn({
        let state = state.clone();
        let shutdown = tx.subscribe();
        async move { server::run_unix_server(&server_path, state, shutdown).await }
    });

    let mut first = connect(&path).await;
    send(&mut first, &ClientEvent::Hello { session_id: None }).await;
    let sid = session_id(&mut first).await;
    send(
        &mut first,
        &ClientEvent::Chat {
            message: "hi".into(),
            is_admin: false,
        },
    )
    .await;
    recv_until(&mut first, |e| matches!(e, ServerEvent::Context { .. })).await;
    drop(first);

    let mut second = connect(&path).await;
    send(
        &mut second,
        &ClientEvent::Hello {
            session_id: Some(sid.clone()),
        },
    )
    .await;
    assert_eq!(session_id(&mut second).await, sid);

    send(&mut second, &ClientEvent::GetHistory {}).await;
    match recv_until(&mut second, |e| matches!(e, ServerEvent::History { .. })).await {
        ServerEvent::History { history } => assert_eq!(history.len(), 2),
        _ => unreachable!(),
    }

    let _ = tx.send(());
}

// ===========================================================================
// TEST 3: a first frame other than hello starts a fresh session and is handled
// ===========================================================================
#[tokio::test]
async fn test_first_frame_without_hello() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("concierge.sock");
    let (tx, _rx) = broadcast::channel(1);
    let state = make_state();
    let server_path = path.to_string_lossy().to_string();
    tokio::spawn({
        let state = state.clone();
        let shutdown = tx.subscribe();
        async move { server::run_unix_server(&server_path, state, shutdown).await }
    });

    let mut client = connect(&path).await;
    send(&mut client, &ClientEvent::GetContext {}).await;
    let sid = session_id(&mut client).await;
    match recv(&mut client).await {
        ServerEvent::Context { context } => assert!(context.is_empty()),
        other => panic!("expected context, got {other:?}"),
    }
    assert!(state.registry.is_connected(&sid));

    let _ = tx.send(());
}

// ===========================================================================
// TEST 4: undecodable frames produce an error event, connection stays up
// ===========================================================================
#[tokio::test]
async fn test_bad_frame_reports_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("concierge.sock");
    let (tx, _rx) = broadcast::channel(1);
    let state = make_state();
    let server_path = path.to_string_lossy().to_string();
    tokio::spawn({
        let state = state.clone();
        let shutdown = tx.subscribe();
        async move { server::run_unix_server(&server_path, state, shutdown).await }
    });

    let mut client = connect(&path).await;
    send(&mut client, &ClientEvent::Hello { session_id: None }).await;
    session_id(&mut client).await;

    client.send(Bytes::from_static(b"\xc1garbage")).await.unwrap();
    assert!(matches!(recv(&mut client).await, ServerEvent::Error { .. }));

    send(&mut client, &ClientEvent::GetHistory {}).await;
    assert!(matches!(recv(&mut client).await, ServerEvent::History { .. }));

    let _ = tx.send(());
}
