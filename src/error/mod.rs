//! Error types for weft.

use thiserror::Error;

/// Broad error category for routing recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Store,
    Network,
    Timeout,
    Server,
    Serialization,
    Llm,
    ToolExecution,
    Authentication,
    Cancelled,
    Unknown,
}

/// Primary error type for all weft operations.
#[derive(Error, Debug)]
pub enum WeftError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Transient backend failure; callers retry with backoff.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Gateway error (status {status}): {message}")]
    Gateway { status: u16, message: String },

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Cancelled")]
    Cancelled,

    /// A tool needs the user to authorize an external account first.
    #[error("Authorization required for {tool_name}")]
    AuthRequired { tool_name: String, auth_url: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl WeftError {
    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    pub fn auth_required(tool_name: impl Into<String>, auth_url: impl Into<String>) -> Self {
        Self::AuthRequired {
            tool_name: tool_name.into(),
            auth_url: auth_url.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::StoreUnavailable(_) | Self::Store(_) => ErrorCategory::Store,
            Self::Network(_) => ErrorCategory::Network,
            Self::Io(_) => ErrorCategory::Store,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Llm(_) | Self::Stream(_) => ErrorCategory::Llm,
            Self::ToolExecution { .. } | Self::ToolNotFound(_) => ErrorCategory::ToolExecution,
            Self::Gateway { status, .. } => match status {
                401 | 403 => ErrorCategory::Authentication,
                429 | 500..=599 => ErrorCategory::Server,
                _ => ErrorCategory::ToolExecution,
            },
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::AuthRequired { .. } => ErrorCategory::Authentication,
            Self::InvalidArgument(_) | Self::InvalidState(_) => ErrorCategory::Unknown,
        }
    }

    /// Whether this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StoreUnavailable(_) => true,
            _ => matches!(
                self.category(),
                ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::Server
            ),
        }
    }
}

impl From<toml::de::Error> for WeftError {
    fn from(error: toml::de::Error) -> Self {
        Self::Configuration(error.to_string())
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, WeftError>;
