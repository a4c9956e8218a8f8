use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Audit entry appended to `memory.tool_usage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUsage {
    pub timestamp: DateTime<Utc>,
    pub tool: String,
    pub params: Value,
}

/// Result of one dispatched tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub tool: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn success(tool: impl Into<String>, result: Value) -> Self {
        Self {
            tool: tool.into(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(tool: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Text fed back to the completion call as the tool's output.
    pub fn summary(&self) -> String {
        match (&self.result, &self.error) {
            (Some(result), _) if self.success => result.to_string(),
            (_, Some(err)) => format!("Error: {err}"),
            _ => String::new(),
        }
    }
}

/// Name, description, and JSON schema of a tool offered to the completion call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A tool invocation requested by the completion backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}
