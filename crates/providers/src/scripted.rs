//! A provider that replays canned responses.
//!
//! Used by tests and by `tasklane run --script <file>` for offline runs.
//! Each request consumes the next step; every response is streamed in small
//! text chunks so the agent's incremental parsing is exercised.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::sync::Mutex;
use tasklane_core::error::ProviderError;
use tasklane_core::provider::*;
use tokio::sync::mpsc;

const CHUNK_CHARS: usize = 16;

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Stream `text`, then report `usage`.
    Respond { text: String, usage: Option<Usage> },
    /// Fail before the first chunk.
    FailFirst(ProviderError),
    /// Stream `text`, then fail.
    FailAfter { text: String, error: ProviderError },
}

impl ScriptStep {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Respond {
            text: text.into(),
            usage: None,
        }
    }
}

/// Script file entry: either a plain response string or `{ "text", "input_tokens", "output_tokens" }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ScriptEntry {
    Text(String),
    WithUsage {
        text: String,
        #[serde(default)]
        input_tokens: u64,
        #[serde(default)]
        output_tokens: u64,
    },
}

pub struct ScriptedProvider {
    steps: Mutex<Vec<ScriptStep>>,
    requests: Mutex<Vec<ModelRequest>>,
    model_info: ModelInfo,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps),
            requests: Mutex::new(Vec::new()),
            model_info: ModelInfo::default(),
        }
    }

    /// Convenience: every step is a plain text response.
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(ScriptStep::text).collect())
    }

    /// Load a JSON array of responses.
    pub fn from_file(path: &Path) -> Result<Self, ProviderError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProviderError::NotConfigured(format!("cannot read script {}: {e}", path.display()))
        })?;
        let entries: Vec<ScriptEntry> = serde_json::from_str(&content).map_err(|e| {
            ProviderError::NotConfigured(format!("invalid script {}: {e}", path.display()))
        })?;
        let steps = entries
            .into_iter()
            .map(|e| match e {
                ScriptEntry::Text(text) => ScriptStep::text(text),
                ScriptEntry::WithUsage { text, input_tokens, output_tokens } => ScriptStep::Respond {
                    text,
                    usage: Some(Usage {
                        input_tokens,
                        output_tokens,
                        ..Usage::default()
                    }),
                },
            })
            .collect();
        Ok(Self::new(steps))
    }

    pub fn with_model_info(mut self, info: ModelInfo) -> Self {
        self.model_info = info;
        self
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Steps not consumed yet.
    pub fn remaining(&self) -> usize {
        self.steps.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn chunk_text(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(CHUNK_CHARS)
        .map(|c| c.iter().collect())
        .collect()
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model_info(&self, _model: &str) -> ModelInfo {
        self.model_info.clone()
    }

    async fn stream(
        &self,
        request: ModelRequest,
    ) -> std::result::Result<mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>, ProviderError>
    {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        let step = {
            let mut steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
            if steps.is_empty() {
                return Err(ProviderError::NotConfigured("script exhausted".into()));
            }
            steps.remove(0)
        };

        let (text, tail) = match step {
            ScriptStep::FailFirst(e) => return Err(e),
            ScriptStep::Respond { text, usage } => {
                let usage = usage.unwrap_or_else(|| Usage {
                    input_tokens: 100,
                    output_tokens: (text.len() as u64).div_ceil(4),
                    ..Usage::default()
                });
                (text, Ok(StreamChunk::Usage(usage)))
            }
            ScriptStep::FailAfter { text, error } => (text, Err(error)),
        };

        let pieces = chunk_text(&text);
        let (tx, rx) = mpsc::channel(pieces.len() + 1);
        for piece in pieces {
            let _ = tx.try_send(Ok(StreamChunk::Text(piece)));
        }
        let _ = tx.try_send(tail);
        Ok(rx)
    }
}
