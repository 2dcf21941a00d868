//! Domain event system: decoupled communication between the runtime and
//! its observers.
//!
//! The UI renderer, the notification bridge and the CLI all subscribe here.
//! None of them can mutate a task; responses go back through the scheduler's
//! task registry by id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use crate::message::{AskKind, TaskId, UiMessage};

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A task was registered and its loop started
    TaskStarted {
        task_id: TaskId,
        instance_id: String,
        parent_id: Option<TaskId>,
        mode: String,
    },

    /// A message was appended to a task's UI log
    MessageAppended { task_id: TaskId, message: UiMessage },

    /// A partial message was updated in place (same `ts`)
    MessageUpdated { task_id: TaskId, message: UiMessage },

    /// A task is suspended waiting for exactly one response
    AskPending {
        task_id: TaskId,
        instance_id: String,
        ask_ts: i64,
        kind: AskKind,
        text: Option<String>,
    },

    /// Live preview of a file edit that has not been approved yet
    DiffPreview {
        task_id: TaskId,
        path: String,
        content: String,
    },

    /// A tool was executed
    ToolExecuted {
        task_id: TaskId,
        tool_name: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A workspace snapshot was stored
    CheckpointSaved {
        task_id: TaskId,
        hash: String,
        timestamp: DateTime<Utc>,
    },

    /// A task finished with an approved completion
    TaskCompleted {
        task_id: TaskId,
        instance_id: String,
        result: String,
    },

    /// A task was aborted
    TaskAborted {
        task_id: TaskId,
        instance_id: String,
        reason: String,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
/// Slow subscribers lag and lose old events; the runtime never waits on them.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
