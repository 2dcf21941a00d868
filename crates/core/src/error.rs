//! Error types for the tasklane domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all tasklane operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Checkpoint errors ---
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    // --- Ask/say errors ---
    #[error("Ask error: {0}")]
    Ask(#[from] AskError),

    // --- Persistence errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Bridge / channel errors ---
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ProviderError {
    /// The provider-mandated wait before the next attempt, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool '{tool_name}' is not allowed in {mode} mode")]
    NotAllowed { tool_name: String, mode: String },

    #[error("Missing value for required parameter '{param}' of {tool_name}")]
    MissingParameter { tool_name: String, param: String },

    #[error("Tool execution failed: {tool_name} — {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Permission denied: {tool_name} — {reason}")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    /// The tool was waiting on the user when the ask went away.
    #[error("Interrupted: {0}")]
    Interrupted(#[from] AskError),
}

impl ToolError {
    /// Validation failures are fed back to the model and count as a mistake.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::NotAllowed { .. }
                | Self::MissingParameter { .. }
                | Self::InvalidArguments(_)
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum CheckpointError {
    #[error("Checkpoint backend not ready after {0}s")]
    InitTimeout(u64),

    #[error("Checkpoint backend failure: {0}")]
    Backend(String),

    #[error("Unknown checkpoint: {0}")]
    NotFound(String),

    #[error("Checkpointing is disabled for this task")]
    Disabled,
}

impl From<std::io::Error> for CheckpointError {
    fn from(e: std::io::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AskError {
    /// A newer message replaced the one this ask was waiting on.
    #[error("Ask {ask_ts} was superseded by a newer message")]
    Superseded { ask_ts: i64 },

    #[error("Task was aborted while waiting for a response")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage I/O failed at {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Corrupt task data at {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("Task not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    #[error("Message delivery failed to {channel}: {reason}")]
    DeliveryFailed { channel: String, reason: String },

    #[error("Unauthorized sender: {sender_id} on {channel}")]
    Unauthorized { channel: String, sender_id: String },

    #[error("Timed out acquiring lock for channel {0}")]
    LockTimeout(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::Provider(ProviderError::ApiError {
            status_code: 503,
            message: "Service unavailable".into(),
        });
        assert!(err.to_string().contains("503"));
        assert!(err.to_string().contains("Service unavailable"));
    }

    #[test]
    fn rate_limit_exposes_retry_after() {
        let err = ProviderError::RateLimited { retry_after_secs: 30 };
        assert_eq!(err.retry_after_secs(), Some(30));
        assert_eq!(ProviderError::Network("reset".into()).retry_after_secs(), None);
    }

    #[test]
    fn missing_parameter_is_validation() {
        let err = ToolError::MissingParameter {
            tool_name: "read_file".into(),
            param: "path".into(),
        };
        assert!(err.is_validation());
        assert!(err.to_string().contains("'path'"));

        let err = ToolError::ExecutionFailed {
            tool_name: "read_file".into(),
            reason: "EACCES".into(),
        };
        assert!(!err.is_validation());
    }
}
