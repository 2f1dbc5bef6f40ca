//! Error types for a3s-code

use crate::llm::FinishReason;
use thiserror::Error;

/// Category of an upstream provider failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Rate limited (429)
    RateLimited,
    /// Provider overloaded or 5xx
    Unavailable,
    /// Could not reach the provider at all
    Connection,
    /// Bad credentials (401/403)
    Authentication,
    /// Request rejected (other 4xx)
    InvalidRequest,
    /// Failure while reading the response stream
    Stream,
}

impl ProviderErrorKind {
    /// Classify an HTTP status code
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimited,
            401 | 403 => Self::Authentication,
            500..=599 => Self::Unavailable,
            _ => Self::InvalidRequest,
        }
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::Connection => "connection",
            Self::Authentication => "authentication",
            Self::InvalidRequest => "invalid_request",
            Self::Stream => "stream",
        };
        f.write_str(s)
    }
}

/// Errors produced by the agent core
#[derive(Debug, Error)]
pub enum CodeError {
    /// Tool input failed schema validation
    #[error("Invalid arguments for tool '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The approver declined a gated tool
    #[error("Permission denied for tool '{tool}'{}", .reason.as_ref().map(|r| format!(": {}", r)).unwrap_or_default())]
    PermissionDenied { tool: String, reason: Option<String> },

    /// User- or shutdown-initiated cancellation
    #[error("Operation cancelled")]
    Cancelled,

    /// A configured upper bound was exceeded
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Upstream provider failure after retries were exhausted
    #[error("Provider error ({kind}{}): {message}", .status.map(|s| format!(", status {}", s)).unwrap_or_default())]
    Provider {
        status: Option<u16>,
        kind: ProviderErrorKind,
        message: String,
    },

    /// Streamed tool-call arguments never became valid JSON
    #[error("Malformed arguments for tool call '{call_id}': {error}")]
    MalformedToolCall { call_id: String, error: String },

    /// A run is already active for the session
    #[error("Agent is busy with another run in session {0}")]
    AgentBusy(String),

    /// The model ended a round with `length` or `error`
    #[error("Model finished with {reason}: {detail}")]
    AbnormalFinish { reason: FinishReason, detail: String },

    /// The run used up its provider round-trips
    #[error("Max tool rounds ({0}) exceeded")]
    MaxRoundsExceeded(usize),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Tool-specific fatal failure
    #[error("Tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CodeError {
    /// Whether the provider layer should retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CodeError::Provider {
                kind: ProviderErrorKind::RateLimited
                    | ProviderErrorKind::Unavailable
                    | ProviderErrorKind::Connection,
                ..
            }
        )
    }

    /// Short machine-readable code, used in JSON output and events
    pub fn code(&self) -> &'static str {
        match self {
            CodeError::InvalidArguments { .. } => "invalid_arguments",
            CodeError::PermissionDenied { .. } => "permission_denied",
            CodeError::Cancelled => "cancelled",
            CodeError::Timeout(_) => "timeout",
            CodeError::Provider { .. } => "provider_error",
            CodeError::MalformedToolCall { .. } => "malformed_tool_call",
            CodeError::AgentBusy(_) => "agent_busy",
            CodeError::AbnormalFinish { .. } => "abnormal_finish",
            CodeError::MaxRoundsExceeded(_) => "max_rounds_exceeded",
            CodeError::SessionNotFound(_) => "session_not_found",
            CodeError::UnknownTool(_) => "unknown_tool",
            CodeError::Tool { .. } => "tool_error",
            CodeError::Store(_) => "store_error",
            CodeError::Config(_) => "config_error",
            CodeError::Internal(_) => "internal_error",
            CodeError::Io(_) => "io_error",
            CodeError::Serialization(_) => "serialization_error",
        }
    }
}

/// Result type alias for agent core operations
pub type Result<T> = std::result::Result<T, CodeError>;
