//! TaskStore trait: durable storage for task conversations.
//!
//! The loop saves both logs after every turn and loads them on resume.
//! Persistence is best-effort: callers log failures and carry on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::StoreError;
use crate::message::{ApiMessage, MessageKind, SayKind, TaskId, UiMessage};

/// Both logs of one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub api_history: Vec<ApiMessage>,
    pub ui_messages: Vec<UiMessage>,
}

/// One row of the task index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub task_id: TaskId,
    /// Last activity (ms).
    pub ts: i64,
    /// The original task text.
    pub task: String,
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<TaskId>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    #[serde(default)]
    pub cache_writes: u64,
    #[serde(default)]
    pub cache_reads: u64,
    pub total_cost: f64,
}

impl HistoryItem {
    /// Summarize a UI log: the first `task` message and the summed accounting.
    pub fn summarize(
        task_id: &TaskId,
        mode: &str,
        parent_id: Option<&TaskId>,
        ui_messages: &[UiMessage],
    ) -> Self {
        let task = ui_messages
            .iter()
            .find(|m| m.kind == MessageKind::Say { say: SayKind::Task })
            .and_then(|m| m.text.clone())
            .unwrap_or_default();

        let mut item = Self {
            task_id: task_id.clone(),
            ts: ui_messages.last().map(|m| m.ts).unwrap_or_default(),
            task,
            mode: mode.to_string(),
            parent_id: parent_id.cloned(),
            tokens_in: 0,
            tokens_out: 0,
            cache_writes: 0,
            cache_reads: 0,
            total_cost: 0.0,
        };
        for acc in ui_messages.iter().filter_map(|m| m.api_request.as_ref()) {
            item.tokens_in += acc.tokens_in;
            item.tokens_out += acc.tokens_out;
            item.cache_writes += acc.cache_writes;
            item.cache_reads += acc.cache_reads;
            item.total_cost += acc.cost;
        }
        item
    }
}

/// The persistence collaborator.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Load both logs of a task.
    async fn load(&self, task_id: &TaskId) -> std::result::Result<TaskSnapshot, StoreError>;

    /// Replace both logs of a task.
    async fn save(
        &self,
        task_id: &TaskId,
        api_history: &[ApiMessage],
        ui_messages: &[UiMessage],
    ) -> std::result::Result<(), StoreError>;

    /// Insert or update the index row for a task.
    async fn save_history_item(&self, item: &HistoryItem) -> std::result::Result<(), StoreError>;

    /// All indexed tasks, most recent first.
    async fn list(&self) -> std::result::Result<Vec<HistoryItem>, StoreError>;

    /// Remove a task and its index row.
    async fn delete(&self, task_id: &TaskId) -> std::result::Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AskKind, TokenAccounting};

    #[test]
    fn summarize_sums_accounting() {
        let mut started = UiMessage::new(2, SayKind::ApiReqStarted, None, false);
        started.api_request = Some(TokenAccounting {
            tokens_in: 10,
            tokens_out: 5,
            cache_writes: 1,
            cache_reads: 2,
            cost: 0.5,
        });
        let mut second = started.clone();
        second.ts = 4;

        let log = vec![
            UiMessage::new(1, SayKind::Task, Some("fix the build".into()), false),
            started,
            UiMessage::new(3, AskKind::Followup, Some("?".into()), false),
            second,
        ];
        let item = HistoryItem::summarize(&TaskId::from("t1"), "code", None, &log);
        assert_eq!(item.task, "fix the build");
        assert_eq!(item.ts, 4);
        assert_eq!(item.tokens_in, 20);
        assert_eq!(item.cache_reads, 4);
        assert!((item.total_cost - 1.0).abs() < f64::EPSILON);
    }
}
