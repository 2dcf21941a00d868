//! The ask/say surface handed to tools.
//!
//! Tools such as `ask_followup_question` or `attempt_completion` need to talk
//! to the human directly. They see only this trait; the agent crate's
//! `Messenger` implements it on top of the task's UI log and pending-ask slot.
//!
//! [`AskResponder`] is the other direction: the single resolution primitive
//! that the terminal, the notification bridge or any UI uses to answer a
//! pending ask.

use async_trait::async_trait;
use crate::error::AskError;
use crate::message::{AskKind, AskResponse, SayKind, TaskId};

#[async_trait]
pub trait UserChannel: Send + Sync {
    /// Post an informational message. Never suspends.
    fn say(&self, kind: SayKind, text: &str);

    /// Post a question and wait for exactly one response.
    async fn ask(&self, kind: AskKind, text: &str) -> Result<AskResponse, AskError>;
}

/// What happened to a response handed to the resolution primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// This response resolved the pending ask.
    Accepted,
    /// Nothing was waiting, or another responder got there first.
    Stale,
}

/// Resolves pending asks by task identity. First writer wins.
pub trait AskResponder: Send + Sync {
    fn respond(&self, task_id: &TaskId, instance_id: &str, response: AskResponse) -> Resolution;
}
