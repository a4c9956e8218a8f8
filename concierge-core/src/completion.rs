//! Language-model completion backend.
//!
//! The server treats completion as an opaque call: directive + history +
//! optional new input + available tools in, text and tool calls out.
//! `ChatCompletionClient` speaks the OpenAI-compatible `/chat/completions` API.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::CompletionConfig;
use crate::error::ConciergeError;
use crate::models::{ToolCall, ToolSpec, Turn, TurnRole};

/// Most recent history turns forwarded to the model.
pub const MAX_HISTORY_MESSAGES: usize = 30;

const MAX_RETRIES: usize = 1;

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        directive: &str,
        history: &[Turn],
        input: Option<&str>,
        tools: &[ToolSpec],
    ) -> Result<CompletionOutput, CompletionError>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionOutput {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Completion API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Completion response had no choices")]
    EmptyResponse,

    #[error("Missing API key")]
    MissingApiKey,
}

impl CompletionError {
    fn is_transient(&self) -> bool {
        match self {
            CompletionError::Http(e) => e.is_timeout() || e.is_connect(),
            CompletionError::Api { code, .. } => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

impl From<CompletionError> for ConciergeError {
    fn from(e: CompletionError) -> Self {
        ConciergeError::UpstreamUnavailable(e.to_string())
    }
}

// ============================================================================
// OpenAI-compatible wire structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChatToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChatToolCall {
    #[serde(default)]
    id: Option<String>,
    function: ChatFunction,
}

#[derive(Debug, Deserialize)]
struct ChatFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn to_messages(directive: &str, history: &[Turn], input: Option<&str>) -> Vec<ChatMessage> {
    let start = history.len().saturating_sub(MAX_HISTORY_MESSAGES);
    let mut messages = Vec::with_capacity(history.len() - start + 2);
    messages.push(ChatMessage {
        role: "system",
        content: directive.to_string(),
    });
    for turn in &history[start..] {
        let message = match turn.role {
            TurnRole::User => ChatMessage {
                role: "user",
                content: turn.content.clone(),
            },
            TurnRole::Assistant => ChatMessage {
                role: "assistant",
                content: turn.content.clone(),
            },
            // Tool results are replayed as system notes; the original call ids
            // are not kept in history.
            TurnRole::Tool => {
                let name = turn.tool_call.as_ref().map(|t| t.name.as_str()).unwrap_or("tool");
                ChatMessage {
                    role: "system",
                    content: format!("Result of {name}: {}", turn.content),
                }
            }
        };
        messages.push(message);
    }
    if let Some(input) = input {
        messages.push(ChatMessage {
            role: "user",
            content: input.to_string(),
        });
    }
    messages
}

fn to_tools(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect()
}

// ============================================================================
// ChatCompletionClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct ChatCompletionClient {
    client: Client,
    config: CompletionConfig,
    api_key: String,
    base_url: String,
}

impl ChatCompletionClient {
    pub fn new(config: CompletionConfig) -> Result<Self, CompletionError> {
        let base_url = config.base_url.clone();
        Self::with_base_url(config, base_url)
    }

    /// Create a client with a custom base URL (for testing / integration)
    pub fn with_base_url(config: CompletionConfig, base_url: String) -> Result<Self, CompletionError> {
        let api_key = config
            .resolved_api_key()
            .ok_or(CompletionError::MissingApiKey)?;
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client,
            config,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn complete_once(&self, request: &ChatRequest) -> Result<CompletionOutput, CompletionError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&error_body)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                .unwrap_or(error_body);
            tracing::error!(code = status.as_u16(), message = %message, "Completion API error");
            return Err(CompletionError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let body: ChatResponse = response.json().await?;
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or(CompletionError::EmptyResponse)?;

        let tool_calls = choice
            .message
            .tool_calls
            .into_iter()
            .map(|c| ToolCall {
                id: c.id,
                arguments: serde_json::from_str(&c.function.arguments)
                    .unwrap_or_else(|_| json!({})),
                name: c.function.name,
            })
            .collect();

        Ok(CompletionOutput {
            text: choice.message.content.unwrap_or_default(),
            tool_calls,
        })
    }
}

#[async_trait]
impl CompletionBackend for ChatCompletionClient {
    async fn complete(
        &self,
        directive: &str,
        history: &[Turn],
        input: Option<&str>,
        tools: &[ToolSpec],
    ) -> Result<CompletionOutput, CompletionError> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: to_messages(directive, history, input),
            tools: to_tools(tools),
        };

        let retry_strategy = ExponentialBackoff::from_millis(500)
            .max_delay(Duration::from_secs(4))
            .map(jitter)
            .take(MAX_RETRIES);

        RetryIf::spawn(
            retry_strategy,
            || self.complete_once(&request),
            CompletionError::is_transient,
        )
        .await
    }

    fn name(&self) -> &str {
        "chat-completions"
    }
}
