//! Message types.
//!
//! A task keeps two ordered logs:
//! - the model-facing history ([`ApiMessage`]), sent with every request
//! - the UI-facing log ([`UiMessage`]), the ask/say stream a human sees
//!
//! UI messages are keyed by their timestamp. Once assigned, `ts` never changes,
//! even when a partial message is later finalized.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    /// First eight characters, used in notifications.
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// The role of a model-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One part of a model-facing message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// Base64 data URL.
    Image { data: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// A message in the model-facing conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMessage {
    pub role: Role,
    pub content: Vec<ContentPart>,

    /// When the message was appended (ms). Used to truncate on checkpoint restore.
    #[serde(default)]
    pub ts: i64,
}

impl ApiMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self::user_parts(vec![ContentPart::text(text)])
    }

    pub fn user_parts(content: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content,
            ts: now_millis(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentPart::text(text)],
            ts: now_millis(),
        }
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Rough character weight, used for token estimation.
    pub fn char_len(&self) -> usize {
        self.content
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => text.len(),
                // Images are billed roughly like a short paragraph
                ContentPart::Image { .. } => 1_000,
            })
            .sum()
    }
}

/// Kinds of questions that suspend the task until answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskKind {
    Followup,
    Command,
    Tool,
    CompletionResult,
    ApiReqFailed,
    MistakeLimitReached,
    ResumeTask,
    ResumeCompletedTask,
}

/// Kinds of informational messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SayKind {
    Task,
    Text,
    Reasoning,
    Error,
    ApiReqStarted,
    ApiReqRetryDelayed,
    UserFeedback,
    CommandOutput,
    CompletionResult,
    CheckpointSaved,
    SubtaskResult,
}

/// Whether a UI message asks or says, and which kind.
///
/// Serialized flat into the message as `"type": "ask", "ask": "followup"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageKind {
    Ask { ask: AskKind },
    Say { say: SayKind },
}

impl MessageKind {
    pub fn is_ask(&self) -> bool {
        matches!(self, Self::Ask { .. })
    }
}

impl From<AskKind> for MessageKind {
    fn from(ask: AskKind) -> Self {
        Self::Ask { ask }
    }
}

impl From<SayKind> for MessageKind {
    fn from(say: SayKind) -> Self {
        Self::Say { say }
    }
}

/// Per-request token usage and cost.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenAccounting {
    pub tokens_in: u64,
    pub tokens_out: u64,
    #[serde(default)]
    pub cache_writes: u64,
    #[serde(default)]
    pub cache_reads: u64,
    #[serde(default)]
    pub cost: f64,
}

impl TokenAccounting {
    /// Everything the request consumed from the context window.
    pub fn total(&self) -> u64 {
        self.tokens_in + self.tokens_out + self.cache_writes + self.cache_reads
    }
}

/// A message in the UI-facing log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiMessage {
    /// Identity key. Never reassigned.
    pub ts: i64,

    #[serde(flatten)]
    pub kind: MessageKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_status: Option<String>,

    /// Token accounting for `api_req_started` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_request: Option<TokenAccounting>,
}

impl UiMessage {
    pub fn new(ts: i64, kind: impl Into<MessageKind>, text: Option<String>, partial: bool) -> Self {
        Self {
            ts,
            kind: kind.into(),
            text,
            images: Vec::new(),
            partial,
            progress_status: None,
            api_request: None,
        }
    }
}

/// How a responder answered an ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Approve,
    Reject,
    Message,
}

/// A responder's answer to a pending ask (`{type: ask_response, ...}` on the wire).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskResponse {
    pub response: ResponseKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl AskResponse {
    pub fn approve() -> Self {
        Self { response: ResponseKind::Approve, text: None, images: Vec::new() }
    }

    pub fn reject() -> Self {
        Self { response: ResponseKind::Reject, text: None, images: Vec::new() }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self {
            response: ResponseKind::Message,
            text: Some(text.into()),
            images: Vec::new(),
        }
    }

    /// Non-empty feedback text, if the responder attached any.
    pub fn feedback(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }
}
