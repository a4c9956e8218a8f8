use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::tool::ToolUsage;

/// Well-known `memory` keys.
pub mod keys {
    pub const USER_INFO: &str = "user_info";
    pub const SELECTED_SERVICES: &str = "selected_services";
    pub const PREFERRED_DATE: &str = "preferred_date";
    pub const PREFERRED_TIME: &str = "preferred_time";
    pub const CURRENT_APPOINTMENT_ID: &str = "current_appointment_id";
    pub const ADMIN_MODE: &str = "admin_mode";
    pub const TOOL_USAGE: &str = "tool_usage";
    pub const TOOL_COUNTS: &str = "tool_counts";
    pub const LAST_MODE: &str = "last_mode";

    /// Key of the cached candidate list for a search-type tool.
    pub fn candidates(tool: &str) -> String {
        format!("{tool}_candidates")
    }
}

/// Most recent tool usage records kept in memory.
pub const TOOL_USAGE_CAP: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    #[default]
    User,
    Assistant,
    Tool,
}

impl<'de> Deserialize<'de> for TurnRole {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            Some("assistant") => TurnRole::Assistant,
            Some("tool") => TurnRole::Tool,
            _ => TurnRole::User,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallMeta {
    pub name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    #[serde(default)]
    pub role: TurnRole,
    #[serde(default, deserialize_with = "any_as_text")]
    pub content: String,
    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallMeta>,
}

impl Turn {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_call: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TurnRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, content)
    }

    pub fn tool(name: &str, params: Value, success: bool, content: impl Into<String>) -> Self {
        Self {
            tool_call: Some(ToolCallMeta {
                name: name.to_string(),
                params,
                success,
            }),
            ..Self::new(TurnRole::Tool, content)
        }
    }
}

/// Durable conversation state for one session or customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    #[serde(default, deserialize_with = "object_or_empty")]
    pub memory: Map<String, Value>,
    #[serde(default, deserialize_with = "lenient_history")]
    pub history: Vec<Turn>,
    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp")]
    pub last_updated: DateTime<Utc>,
    #[serde(default, deserialize_with = "object_or_empty")]
    pub session_properties: Map<String, Value>,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            memory: Map::new(),
            history: Vec::new(),
            last_updated: Utc::now(),
            session_properties: Map::new(),
        }
    }
}

impl Context {
    /// Parse a stored record. Anything unreadable yields an empty context.
    pub fn from_value(value: Value) -> Self {
        serde_json::from_value(value).unwrap_or_default()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty() && self.history.is_empty() && self.session_properties.is_empty()
    }

    // ---- memory accessors ----

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.memory.get(key).filter(|v| !v.is_null())
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(value_as_id)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.memory.insert(key.into(), value);
        self.touch();
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.memory.remove(key);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    pub fn user_info(&self) -> Option<&Value> {
        self.get(keys::USER_INFO).filter(|v| v.is_object())
    }

    /// Customer identifier from `user_info.id`, if identity is known.
    pub fn customer_id(&self) -> Option<String> {
        self.user_info()
            .and_then(|u| u.get("id"))
            .and_then(value_as_id)
    }

    pub fn customer_name(&self) -> Option<String> {
        self.user_info()
            .and_then(|u| u.get("name"))
            .and_then(|n| n.as_str())
            .map(str::to_string)
    }

    pub fn has_identity(&self) -> bool {
        self.customer_id().is_some()
    }

    pub fn appointment_id(&self) -> Option<String> {
        self.get_str(keys::CURRENT_APPOINTMENT_ID)
    }

    pub fn admin_mode(&self) -> Option<bool> {
        self.get(keys::ADMIN_MODE).and_then(Value::as_bool)
    }

    /// Sets the role flag only if it has never been set for this context.
    pub fn ensure_admin_mode(&mut self, is_admin: bool) {
        if self.admin_mode().is_none() {
            self.set(keys::ADMIN_MODE, Value::Bool(is_admin));
        }
    }

    pub fn selected_services(&self) -> Vec<Value> {
        self.get(keys::SELECTED_SERVICES)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    // ---- history ----

    pub fn push_turn(&mut self, turn: Turn) {
        self.history.push(turn);
        self.touch();
    }

    /// Last `n` turns in chronological order.
    pub fn recent_turns(&self, n: usize) -> &[Turn] {
        let start = self.history.len().saturating_sub(n);
        &self.history[start..]
    }

    pub fn merge_session_properties(&mut self, props: &Map<String, Value>) {
        if props.is_empty() {
            return;
        }
        for (k, v) in props {
            self.session_properties.insert(k.clone(), v.clone());
        }
        self.touch();
    }

    /// Append an audit record and bump the per-tool counter.
    pub fn record_tool_usage(&mut self, tool: &str, params: &Value) {
        let usage = ToolUsage {
            timestamp: Utc::now(),
            tool: tool.to_string(),
            params: params.clone(),
        };
        let mut log = self
            .get(keys::TOOL_USAGE)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        log.push(serde_json::to_value(usage).unwrap_or(Value::Null));
        if log.len() > TOOL_USAGE_CAP {
            let excess = log.len() - TOOL_USAGE_CAP;
            log.drain(..excess);
        }
        self.memory.insert(keys::TOOL_USAGE.to_string(), Value::Array(log));

        let mut counts = self
            .get(keys::TOOL_COUNTS)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let next = counts.get(tool).and_then(Value::as_u64).unwrap_or(0) + 1;
        counts.insert(tool.to_string(), Value::from(next));
        self.memory.insert(keys::TOOL_COUNTS.to_string(), Value::Object(counts));
        self.touch();
    }

    /// Clear everything except the role flag.
    pub fn reset(&mut self) {
        let admin = self.admin_mode();
        self.memory.clear();
        self.history.clear();
        self.session_properties.clear();
        if let Some(admin) = admin {
            self.memory.insert(keys::ADMIN_MODE.to_string(), Value::Bool(admin));
        }
        self.touch();
    }

    /// Fold a session-keyed context into this (customer-keyed) one.
    ///
    /// Existing history comes first, then the session's turns. Session memory
    /// values overwrite existing ones; `admin_mode` is taken from the session
    /// when the session has one.
    pub fn absorb(&mut self, session: Context) {
        let Context {
            memory,
            history,
            session_properties,
            ..
        } = session;
        for (k, v) in memory {
            if v.is_null() {
                continue;
            }
            self.memory.insert(k, v);
        }
        self.history.extend(history);
        for (k, v) in session_properties {
            self.session_properties.insert(k, v);
        }
        self.touch();
    }

    /// The part of this context that moves with a session switching to another
    /// customer: turns from `seen` on, the identity and role flag, and the
    /// session properties. Everything else belongs to the previous customer.
    pub fn carry_over(self, seen: usize) -> Context {
        let mut out = Context {
            session_properties: self.session_properties,
            ..Context::default()
        };
        for key in [keys::USER_INFO, keys::ADMIN_MODE] {
            if let Some(v) = self.memory.get(key) {
                out.memory.insert(key.to_string(), v.clone());
            }
        }
        out.history = self.history.into_iter().skip(seen).collect();
        out
    }
}

/// Render an id-like JSON value (string or number) as a string.
pub fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn object_or_empty<'de, D: Deserializer<'de>>(d: D) -> Result<Map<String, Value>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Object(map) => map,
        _ => Map::new(),
    })
}

fn lenient_history<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Turn>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Array(items) => items
            .into_iter()
            .filter(Value::is_object)
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        _ => Vec::new(),
    })
}

fn lenient_timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = Value::deserialize(d)?;
    Ok(match &raw {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now),
        _ => Utc::now(),
    })
}

fn any_as_text<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}
