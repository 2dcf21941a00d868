//! OpenAI-compatible streaming provider.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, and any endpoint exposing
//! `/v1/chat/completions` with SSE streaming. Tool calls are not sent as
//! function definitions; they arrive as XML tags inside the text and are
//! parsed by the agent.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tasklane_core::error::ProviderError;
use tasklane_core::message::{ApiMessage, ContentPart, Role};
use tasklane_core::provider::*;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// An OpenAI-compatible streaming provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    model_info: ModelInfo,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        // No overall timeout: streams can legitimately run for minutes.
        // The task loop bounds the wait for the first chunk.
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
            model_info: ModelInfo::default(),
        }
    }

    /// Create an OpenRouter provider (convenience constructor).
    pub fn openrouter(api_key: impl Into<String>) -> Self {
        Self::new("openrouter", "https://openrouter.ai/api/v1", api_key)
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key)
    }

    /// Create an Ollama provider (convenience constructor).
    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::new(
            "ollama",
            base_url.unwrap_or("http://localhost:11434/v1"),
            "ollama", // Ollama doesn't need a real key
        )
    }

    /// Override the context limits reported to the task loop.
    pub fn with_model_info(mut self, info: ModelInfo) -> Self {
        self.model_info = info;
        self
    }

    /// Convert a request into OpenAI chat messages, system prompt first.
    fn to_wire_messages(request: &ModelRequest) -> Vec<WireMessage> {
        let mut out = Vec::with_capacity(request.messages.len() + 1);
        out.push(WireMessage {
            role: "system".into(),
            content: WireContent::Text(request.system_prompt.clone()),
        });
        for m in &request.messages {
            out.push(WireMessage {
                role: match m.role {
                    Role::User => "user".into(),
                    Role::Assistant => "assistant".into(),
                },
                content: Self::to_wire_content(m),
            });
        }
        out
    }

    fn to_wire_content(message: &ApiMessage) -> WireContent {
        let has_images = message
            .content
            .iter()
            .any(|p| matches!(p, ContentPart::Image { .. }));
        if !has_images {
            return WireContent::Text(message.text());
        }
        WireContent::Parts(
            message
                .content
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => WirePart::Text { text: text.clone() },
                    ContentPart::Image { data } => WirePart::ImageUrl {
                        image_url: WireImageUrl { url: data.clone() },
                    },
                })
                .collect(),
        )
    }
}

/// Parse one SSE `data:` payload into zero or more chunks.
///
/// Returns `None` for the `[DONE]` sentinel.
pub(crate) fn parse_sse_data(data: &str) -> Option<Vec<StreamChunk>> {
    let data = data.trim();
    if data == "[DONE]" {
        return None;
    }

    let mut chunks = Vec::new();
    match serde_json::from_str::<StreamResponse>(data) {
        Ok(resp) => {
            if let Some(choice) = resp.choices.first() {
                let reasoning = choice
                    .delta
                    .reasoning
                    .as_ref()
                    .or(choice.delta.reasoning_content.as_ref());
                if let Some(r) = reasoning.filter(|r| !r.is_empty()) {
                    chunks.push(StreamChunk::Reasoning(r.clone()));
                }
                if let Some(c) = choice.delta.content.as_ref().filter(|c| !c.is_empty()) {
                    chunks.push(StreamChunk::Text(c.clone()));
                }
            }
            if let Some(u) = resp.usage {
                let cached = u
                    .prompt_tokens_details
                    .as_ref()
                    .map(|d| d.cached_tokens)
                    .unwrap_or(0);
                chunks.push(StreamChunk::Usage(Usage {
                    input_tokens: u.prompt_tokens.saturating_sub(cached),
                    output_tokens: u.completion_tokens,
                    cache_write_tokens: 0,
                    cache_read_tokens: cached,
                    total_cost: u.cost,
                }));
            }
        }
        Err(e) => {
            trace!(error = %e, data = %data, "Skipping unparseable SSE chunk");
        }
    }
    Some(chunks)
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_info(&self, _model: &str) -> ModelInfo {
        self.model_info.clone()
    }

    async fn stream(
        &self,
        request: ModelRequest,
    ) -> std::result::Result<mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>, ProviderError>
    {
        let url = format!("{}/chat/completions", self.base_url);

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_wire_messages(&request),
            "temperature": request.temperature,
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        debug!(provider = %self.name, model = %request.model, "Sending streaming request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status().as_u16();

        if status == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return Err(ProviderError::RateLimited { retry_after_secs });
        }

        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Provider streaming error");
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        let (tx, rx) = mpsc::channel(64);
        let provider_name = self.name.clone();

        // Spawn task to read the SSE byte stream and parse chunks
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // Process complete lines
                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim_end_matches('\r').to_string();
                    buffer.drain(..=line_end);

                    // Skip empty lines and SSE comments
                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }

                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };

                    match parse_sse_data(data) {
                        None => {
                            debug!(provider = %provider_name, "Stream finished");
                            return;
                        }
                        Some(chunks) => {
                            for chunk in chunks {
                                if tx.send(Ok(chunk)).await.is_err() {
                                    // Receiver dropped: the task was aborted
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

// --- OpenAI wire types ---

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: WireContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<WirePart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WirePart {
    Text { text: String },
    ImageUrl { image_url: WireImageUrl },
}

#[derive(Debug, Serialize)]
struct WireImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
    /// OpenRouter reports the billed cost
    #[serde(default)]
    cost: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openrouter_constructor() {
        let provider = OpenAiCompatProvider::openrouter("sk-test");
        assert_eq!(provider.name(), "openrouter");
        assert!(provider.base_url.contains("openrouter.ai"));
    }

    #[test]
    fn ollama_constructor() {
        let provider = OpenAiCompatProvider::ollama(None);
        assert_eq!(provider.name(), "ollama");
        assert!(provider.base_url.contains("localhost:11434"));
    }

    #[test]
    fn system_prompt_goes_first() {
        let request = ModelRequest {
            model: "m".into(),
            system_prompt: "You are careful".into(),
            messages: vec![ApiMessage::user("Hello"), ApiMessage::assistant("Hi")],
            temperature: 0.0,
            max_tokens: None,
        };
        let wire = OpenAiCompatProvider::to_wire_messages(&request);
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[2].role, "assistant");
    }

    #[test]
    fn images_use_content_parts() {
        let msg = ApiMessage::user_parts(vec![
            ContentPart::text("look"),
            ContentPart::Image { data: "data:image/png;base64,AAA".into() },
        ]);
        let json = serde_json::to_value(OpenAiCompatProvider::to_wire_content(&msg)).unwrap();
        assert_eq!(json[1]["type"], "image_url");
        assert_eq!(json[1]["image_url"]["url"], "data:image/png;base64,AAA");
    }

    // --- SSE parsing tests ---

    #[test]
    fn sse_text_delta() {
        let chunks =
            parse_sse_data(r#" {"choices":[{"delta":{"content":"Hel"}}]}"#).unwrap();
        assert_eq!(chunks, vec![StreamChunk::Text("Hel".into())]);
    }

    #[test]
    fn sse_done_sentinel() {
        assert!(parse_sse_data(" [DONE]").is_none());
    }

    #[test]
    fn sse_usage_splits_cached_tokens() {
        let chunks = parse_sse_data(
            r#"{"choices":[],"usage":{"prompt_tokens":100,"completion_tokens":20,"prompt_tokens_details":{"cached_tokens":60},"cost":0.01}}"#,
        )
        .unwrap();
        match &chunks[0] {
            StreamChunk::Usage(u) => {
                assert_eq!(u.input_tokens, 40);
                assert_eq!(u.cache_read_tokens, 60);
                assert_eq!(u.output_tokens, 20);
                assert_eq!(u.total_cost, Some(0.01));
            }
            other => panic!("expected usage, got {other:?}"),
        }
    }

    #[test]
    fn sse_reasoning_delta() {
        let chunks =
            parse_sse_data(r#"{"choices":[{"delta":{"reasoning":"thinking","content":""}}]}"#)
                .unwrap();
        assert_eq!(chunks, vec![StreamChunk::Reasoning("thinking".into())]);
    }

    #[test]
    fn sse_garbage_is_skipped() {
        assert_eq!(parse_sse_data("{not json").unwrap(), Vec::<StreamChunk>::new());
    }
}
