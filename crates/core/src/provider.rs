//! Provider trait: the abstraction over streaming model backends.
//!
//! The task loop only ever streams: it needs the first chunk to decide whether
//! a failure is retryable, and it re-parses the accumulated text after every
//! chunk.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use crate::error::ProviderError;
use crate::message::ApiMessage;

/// A streaming model request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    /// The model to use (e.g., "anthropic/claude-sonnet-4")
    pub model: String,

    /// System prompt (mode role, tool usage, rules)
    pub system_prompt: String,

    /// The conversation history, after truncation
    pub messages: Vec<ApiMessage>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_temperature() -> f32 {
    0.0
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    /// Some gateways report the billed cost directly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
}

/// A single chunk in a streaming response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StreamChunk {
    Text(String),
    Reasoning(String),
    Usage(Usage),
}

/// Context limits of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub context_window: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
}

impl Default for ModelInfo {
    fn default() -> Self {
        Self {
            context_window: 128_000,
            max_output_tokens: Some(8_192),
        }
    }
}

/// The core Provider trait.
///
/// `stream()` failing, or the first received item being an error, is a
/// first-chunk failure and may be retried. An error after that is a
/// mid-stream failure.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openrouter").
    fn name(&self) -> &str;

    /// Context limits for the given model.
    fn model_info(&self, _model: &str) -> ModelInfo {
        ModelInfo::default()
    }

    /// Send a request and get a stream of response chunks.
    async fn stream(
        &self,
        request: ModelRequest,
    ) -> std::result::Result<mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>, ProviderError>;
}
