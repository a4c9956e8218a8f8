use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConciergeError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input for '{field}': {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ConciergeError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable tag, used in HTTP error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidInput { .. } => "invalid_input",
            Self::UpstreamUnavailable(_) | Self::Database(_) => "upstream_unavailable",
            Self::Configuration(_) | Self::Config(_) => "configuration",
            Self::Io(_) => "io",
            Self::Protocol(_) => "protocol",
        }
    }

    /// True for failures the caller may retry later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable(_) | Self::Database(_) | Self::Io(_)
        )
    }
}
