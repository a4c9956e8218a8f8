//! WebSocket transport: JSON text frames carrying the same event envelope as
//! the socket transport. Binary frames are accepted as MessagePack.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use concierge_core::ipc::{self, ServerEvent};
use concierge_core::models::Role;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::router;
use crate::state::ServerState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsParams {
    pub session_id: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.session_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>, supplied: Option<String>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let (session_id, connection_id) = state.registry.connect(supplied.as_deref(), tx, Role::Customer);
    tracing::info!(session_id = %session_id, %connection_id, "WebSocket client connected");

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match ipc::encode_json(&event) {
                Ok(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        tracing::debug!("WebSocket send failed: {}", e);
                        break;
                    }
                }
                Err(e) => tracing::error!("Failed to serialize event: {}", e),
            }
        }
        let _ = sink.close().await;
    });

    while let Some(msg) = stream.next().await {
        let decoded = match msg {
            Ok(Message::Text(text)) => ipc::decode_client_json(&text),
            Ok(Message::Binary(bytes)) => ipc::decode_client_msgpack(&bytes),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(session_id = %session_id, "WebSocket error: {}", e);
                break;
            }
        };
        match decoded {
            Ok(event) => router::handle_event(&state, &session_id, event).await,
            Err(e) => {
                state.registry.send(&session_id, ServerEvent::error(e.to_string()));
            }
        }
    }

    let unbound = state.registry.disconnect(&session_id, connection_id);
    tracing::info!(session_id = %session_id, unbound, "WebSocket client disconnected");
    if !unbound {
        writer.abort();
    }
    let _ = writer.await;
}
