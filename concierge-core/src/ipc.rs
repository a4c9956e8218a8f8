//! Real-time event protocol shared by the socket and WebSocket transports.
//!
//! Every frame is an envelope `{"event": <name>, "data": {...}}` with
//! camelCase field names. The socket transport carries it as MessagePack,
//! the WebSocket transport as JSON text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConciergeError;
use crate::models::{Context, ToolOutcome, Turn, TurnRole};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    Hello {
        #[serde(default)]
        session_id: Option<String>,
    },
    Welcome {
        #[serde(default)]
        is_admin: bool,
    },
    LoadCustomer {
        resource_name: String,
        #[serde(default)]
        is_admin: bool,
    },
    Chat {
        message: String,
        #[serde(default)]
        is_admin: bool,
    },
    ClearContext {},
    GetContext {},
    GetHistory {},
    UseTool {
        tool: String,
        #[serde(default)]
        params: Value,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Hello { .. } => "hello",
            ClientEvent::Welcome { .. } => "welcome",
            ClientEvent::LoadCustomer { .. } => "loadCustomer",
            ClientEvent::Chat { .. } => "chat",
            ClientEvent::ClearContext {} => "clearContext",
            ClientEvent::GetContext {} => "getContext",
            ClientEvent::GetHistory {} => "getHistory",
            ClientEvent::UseTool { .. } => "useTool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    Session {
        session_id: String,
    },
    Message {
        role: TurnRole,
        content: String,
        id: String,
    },
    Typing {
        typing: bool,
    },
    Context {
        context: Context,
    },
    History {
        history: Vec<Turn>,
    },
    ToolResult {
        tool: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn assistant_message(content: impl Into<String>) -> Self {
        ServerEvent::Message {
            role: TurnRole::Assistant,
            content: content.into(),
            id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }
}

impl From<ToolOutcome> for ServerEvent {
    fn from(outcome: ToolOutcome) -> Self {
        ServerEvent::ToolResult {
            tool: outcome.tool,
            success: outcome.success,
            result: outcome.result,
            error: outcome.error,
        }
    }
}

/// Loosely-typed envelope; tolerates missing or null `data`.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    event: String,
    #[serde(default)]
    data: Value,
}

fn from_envelope(raw: RawEnvelope) -> Result<ClientEvent, ConciergeError> {
    let data = match raw.data {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    let event = raw.event;
    serde_json::from_value(serde_json::json!({ "event": event, "data": data }))
        .map_err(|e| ConciergeError::Protocol(format!("bad '{event}' event: {e}")))
}

pub fn decode_client_msgpack(bytes: &[u8]) -> Result<ClientEvent, ConciergeError> {
    let raw: RawEnvelope =
        rmp_serde::from_slice(bytes).map_err(|e| ConciergeError::Protocol(e.to_string()))?;
    from_envelope(raw)
}

pub fn decode_client_json(text: &str) -> Result<ClientEvent, ConciergeError> {
    let raw: RawEnvelope =
        serde_json::from_str(text).map_err(|e| ConciergeError::Protocol(e.to_string()))?;
    from_envelope(raw)
}

pub fn encode_msgpack<T: Serialize>(event: &T) -> Result<Vec<u8>, ConciergeError> {
    rmp_serde::to_vec_named(event).map_err(|e| ConciergeError::Protocol(e.to_string()))
}

pub fn encode_json<T: Serialize>(event: &T) -> Result<String, ConciergeError> {
    serde_json::to_string(event).map_err(|e| ConciergeError::Protocol(e.to_string()))
}

/// Decode a server event from MessagePack; used by socket clients and tests.
pub fn decode_server_msgpack(bytes: &[u8]) -> Result<ServerEvent, ConciergeError> {
    rmp_serde::from_slice(bytes).map_err(|e| ConciergeError::Protocol(e.to_string()))
}
