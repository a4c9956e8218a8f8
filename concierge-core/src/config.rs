use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::error::ConciergeError;

/// Upper bound for any collaborator call (scheduling API, completion API, durable store).
pub const MAX_UPSTREAM_TIMEOUT_SECS: u64 = 30;

fn bounded_timeout(seconds: u64) -> Duration {
    Duration::from_secs(seconds.clamp(1, MAX_UPSTREAM_TIMEOUT_SECS))
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConciergeConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub router: RouterConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub socket_path: String,
    pub log_level: String,
    /// IANA timezone of the salon, used for "today"/"tomorrow" and slot formatting.
    pub timezone: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/concierge.sock".to_string(),
            log_level: "info".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Socket path with `~` and environment variables expanded.
    pub fn resolved_socket_path(&self) -> String {
        shellexpand::full(&self.socket_path)
            .map(|p| p.into_owned())
            .unwrap_or_else(|_| self.socket_path.clone())
    }

    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or(chrono_tz::UTC)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub enabled: bool,
    pub url: String,
    pub max_connections: u32,
    pub table: String,
    pub provision_poll_ms: u64,
    pub provision_attempts: usize,
    pub timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            max_connections: 5,
            table: "conversation_contexts".to_string(),
            provision_poll_ms: 500,
            provision_attempts: 20,
            timeout_seconds: 10,
        }
    }
}

impl DatabaseConfig {
    pub fn timeout(&self) -> Duration {
        bounded_timeout(self.timeout_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8770,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulingConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            api_key: None,
            timeout_seconds: 30,
            max_retries: 2,
            retry_delay_ms: 250,
        }
    }
}

impl SchedulingConfig {
    pub fn timeout(&self) -> Duration {
        bounded_timeout(self.timeout_seconds)
    }

    pub fn resolved_api_key(&self) -> Option<String> {
        non_empty(self.api_key.clone()).or_else(|| non_empty(std::env::var("SCHEDULING_API_KEY").ok()))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    pub max_tool_rounds: usize,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            timeout_seconds: 30,
            max_tool_rounds: 4,
        }
    }
}

impl CompletionConfig {
    pub fn timeout(&self) -> Duration {
        bounded_timeout(self.timeout_seconds)
    }

    pub fn resolved_api_key(&self) -> Option<String> {
        non_empty(self.api_key.clone()).or_else(|| non_empty(std::env::var("COMPLETION_API_KEY").ok()))
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    pub token_secret: Option<String>,
}

impl AuthConfig {
    pub fn resolved_secret(&self) -> Option<String> {
        non_empty(self.token_secret.clone())
            .or_else(|| non_empty(std::env::var("CONCIERGE_TOKEN_SECRET").ok()))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouterConfig {
    /// Number of most recent history turns inspected for intent.
    pub recency_window: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { recency_window: 3 }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl ConciergeConfig {
    /// Load from a TOML file (optional) layered with `CONCIERGE__SECTION__KEY` env vars.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("CONCIERGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        s.try_deserialize()
    }

    /// Check that every credential the server needs at runtime is present.
    pub fn validate(&self) -> Result<(), ConciergeError> {
        let mut missing = Vec::new();
        if self.scheduling.resolved_api_key().is_none() {
            missing.push("scheduling.api_key (or SCHEDULING_API_KEY)");
        }
        if self.completion.resolved_api_key().is_none() {
            missing.push("completion.api_key (or COMPLETION_API_KEY)");
        }
        if self.auth.resolved_secret().is_none() {
            missing.push("auth.token_secret (or CONCIERGE_TOKEN_SECRET)");
        }
        if self.database.enabled && self.database.url.trim().is_empty() {
            missing.push("database.url");
        }
        if !missing.is_empty() {
            return Err(ConciergeError::Configuration(format!(
                "missing required settings: {}",
                missing.join(", ")
            )));
        }
        if self.service.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(ConciergeError::Configuration(format!(
                "unknown timezone '{}'",
                self.service.timezone
            )));
        }
        Ok(())
    }
}
