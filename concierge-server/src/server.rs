use crate::router;
use crate::state::ServerState;
use bytes::Bytes;
use concierge_core::ipc::{self, ClientEvent, ServerEvent};
use concierge_core::models::Role;
use futures::{SinkExt, StreamExt};
use std::path::Path;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

pub async fn run_unix_server(
    socket_path: &str,
    state: Arc<ServerState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    if Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    tracing::info!("Concierge socket listening on {}", socket_path);

    loop {
        tokio::select! {
            res = listener.accept() => {
                let (stream, _) = res?;
                let state = state.clone();
                tokio::spawn(handle_connection(stream, state));
            }
            _ = shutdown.recv() => {
                tracing::info!("Shutting down socket server...");
                break;
            }
        }
    }

    if Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path)?;
    }

    Ok(())
}

/// One client connection: 4-byte little-endian length prefix + MessagePack event.
async fn handle_connection(stream: UnixStream, state: Arc<ServerState>) {
    let (read, write) = stream.into_split();
    let le_codec = || LengthDelimitedCodec::builder().little_endian().new_codec();
    let mut framed_read = FramedRead::new(read, le_codec());
    let mut framed_write = FramedWrite::new(write, le_codec());

    // A leading hello may carry a session id to resume; anything else starts
    // a fresh session and is processed after binding.
    let (supplied, pending) = match framed_read.next().await {
        Some(Ok(frame)) => match ipc::decode_client_msgpack(&frame) {
            Ok(ClientEvent::Hello { session_id }) => (session_id, None),
            Ok(other) => (None, Some(Ok(other))),
            Err(e) => (None, Some(Err(e))),
        },
        Some(Err(e)) => {
            tracing::error!("Frame error before handshake: {}", e);
            return;
        }
        None => return,
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let (session_id, connection_id) = state.registry.connect(supplied.as_deref(), tx, Role::Customer);
    tracing::info!(session_id = %session_id, %connection_id, "Socket client connected");

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match ipc::encode_msgpack(&event) {
                Ok(bytes) => {
                    if let Err(e) = framed_write.send(Bytes::from(bytes)).await {
                        tracing::error!("Failed to send event: {}", e);
                        break;
                    }
                }
                Err(e) => tracing::error!("Failed to serialize event: {}", e),
            }
        }
    });

    match pending {
        Some(Ok(event)) => router::handle_event(&state, &session_id, event).await,
        Some(Err(e)) => {
            state.registry.send(&session_id, ServerEvent::error(e.to_string()));
        }
        None => {}
    }

    while let Some(frame) = framed_read.next().await {
        match frame {
            Ok(bytes_mut) => match ipc::decode_client_msgpack(&bytes_mut) {
                Ok(event) => router::handle_event(&state, &session_id, event).await,
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Undecodable frame");
                    state.registry.send(&session_id, ServerEvent::error(e.to_string()));
                }
            },
            Err(e) => {
                tracing::error!("Frame error: {}", e);
                break;
            }
        }
    }

    // Dropping the binding closes the writer's channel.
    let unbound = state.registry.disconnect(&session_id, connection_id);
    tracing::info!(session_id = %session_id, unbound, "Socket client disconnected");
    if !unbound {
        writer.abort();
    }
    let _ = writer.await;
}
