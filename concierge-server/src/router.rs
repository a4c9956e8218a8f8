use concierge_core::ipc::{ClientEvent, ServerEvent};

use crate::state::ServerState;

/// Route one decoded client event for a bound session.
///
/// Replies go out through the session registry, so both transports share
/// this entry point.
pub async fn handle_event(state: &ServerState, session_id: &str, event: ClientEvent) {
    tracing::debug!(session_id, event = event.name(), "Client event");
    let engine = &state.engine;

    match event {
        ClientEvent::Hello { .. } => {
            // Only meaningful as the first frame; a repeat just re-announces the session.
            state.registry.send(
                session_id,
                ServerEvent::Session {
                    session_id: session_id.to_string(),
                },
            );
        }
        ClientEvent::Welcome { is_admin } => engine.welcome(session_id, is_admin).await,
        ClientEvent::LoadCustomer {
            resource_name,
            is_admin,
        } => {
            if resource_name.trim().is_empty() {
                state
                    .registry
                    .send(session_id, ServerEvent::error("resourceName is required"));
            } else {
                engine.load_customer(session_id, resource_name.trim(), is_admin).await;
            }
        }
        ClientEvent::Chat { message, is_admin } => {
            if message.trim().is_empty() {
                state
                    .registry
                    .send(session_id, ServerEvent::error("message must not be empty"));
            } else {
                engine.chat(session_id, &message, is_admin).await;
            }
        }
        ClientEvent::ClearContext {} => engine.clear_context(session_id).await,
        ClientEvent::GetContext {} => engine.get_context(session_id).await,
        ClientEvent::GetHistory {} => engine.get_history(session_id).await,
        ClientEvent::UseTool { tool, params } => {
            // Result and failure are both reported as events.
            let _ = engine.use_tool(session_id, &tool, &params).await;
        }
    }
}
