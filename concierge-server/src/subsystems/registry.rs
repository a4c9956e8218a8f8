//! Session registry: binds live connections to session identifiers.
//!
//! Transports hand the registry an outbound event channel per connection.
//! A session id maps to at most one live binding; reconnecting with the
//! same id replaces the older binding.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use concierge_core::ipc::ServerEvent;
use concierge_core::models::{is_valid_session_id, new_session_id, Role};
use tokio::sync::mpsc;
use uuid::Uuid;

pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

struct Binding {
    connection_id: Uuid,
    sender: EventSender,
    role: Role,
}

#[derive(Default)]
pub struct SessionRegistry {
    bindings: Mutex<HashMap<String, Binding>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn bindings(&self) -> MutexGuard<'_, HashMap<String, Binding>> {
        self.bindings.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Bind a new connection. A well-formed supplied id is reused, anything
    /// else gets a fresh id. Emits `session {sessionId}` on the new sender.
    pub fn connect(&self, supplied: Option<&str>, sender: EventSender, role: Role) -> (String, Uuid) {
        let session_id = match supplied {
            Some(id) if is_valid_session_id(id) => id.to_string(),
            Some(id) => {
                tracing::warn!(supplied = %id, "Rejected malformed session id, minting a new one");
                new_session_id()
            }
            None => new_session_id(),
        };
        let connection_id = Uuid::new_v4();

        let _ = sender.send(ServerEvent::Session {
            session_id: session_id.clone(),
        });

        let previous = self.bindings().insert(
            session_id.clone(),
            Binding {
                connection_id,
                sender,
                role,
            },
        );
        if let Some(previous) = previous {
            tracing::info!(
                session_id = %session_id,
                replaced = %previous.connection_id,
                "Session rebound to new connection"
            );
        } else {
            tracing::debug!(session_id = %session_id, connection_id = %connection_id, "Session connected");
        }

        (session_id, connection_id)
    }

    /// Best-effort delivery. Returns false when the session has no live binding.
    pub fn send(&self, session_id: &str, event: ServerEvent) -> bool {
        let bindings = self.bindings();
        match bindings.get(session_id) {
            Some(binding) => binding.sender.send(event).is_ok(),
            None => {
                tracing::debug!(session_id, "Dropping event for unbound session");
                false
            }
        }
    }

    /// Unbind only when the binding still belongs to `connection_id`.
    pub fn disconnect(&self, session_id: &str, connection_id: Uuid) -> bool {
        let mut bindings = self.bindings();
        let owned = bindings
            .get(session_id)
            .is_some_and(|b| b.connection_id == connection_id);
        if owned {
            bindings.remove(session_id);
            tracing::debug!(session_id, %connection_id, "Session disconnected");
        }
        owned
    }

    pub fn set_role(&self, session_id: &str, role: Role) {
        if let Some(binding) = self.bindings().get_mut(session_id) {
            binding.role = role;
        }
    }

    pub fn role_of(&self, session_id: &str) -> Option<Role> {
        self.bindings().get(session_id).map(|b| b.role)
    }

    pub fn connected_count(&self) -> usize {
        self.bindings().len()
    }

    pub fn is_connected(&self, session_id: &str) -> bool {
        self.bindings().contains_key(session_id)
    }
}
