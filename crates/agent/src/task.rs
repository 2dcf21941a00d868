//! Task state, the handles the scheduler keeps for lookup by id, and the
//! parent/child pause handshake.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tasklane_core::message::{ApiMessage, ContentPart, TaskId, TokenAccounting};
use tasklane_core::mode::Mode;
use tasklane_core::tool::ToolContext;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointManager;
use crate::messenger::Messenger;

/// How a task's loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// A completion was accepted.
    Completed { result: String },
    Aborted { reason: String },
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// What a paused parent learns about its child.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildOutcome {
    Finished(TaskOutcome),
    TimedOut { secs: u64 },
}

impl ChildOutcome {
    /// The synthetic user-turn text handed back to the parent.
    pub fn report(&self) -> String {
        match self {
            Self::Finished(TaskOutcome::Completed { result }) => {
                format!("[new_task completed] Result: {result}")
            }
            Self::Finished(TaskOutcome::Aborted { reason }) => {
                format!("[new_task aborted] The sub-task ended without a result: {reason}")
            }
            Self::TimedOut { secs } => format!(
                "[new_task timed out] The sub-task did not finish within {secs} seconds and was aborted."
            ),
        }
    }
}

/// Pause flag plus the slot a finishing child writes its outcome into.
/// Only the child the parent is waiting on may fill it.
#[derive(Debug, Default)]
pub struct PauseSlot {
    paused: AtomicBool,
    inner: Mutex<SlotState>,
}

#[derive(Debug, Default)]
struct SlotState {
    waiting_on: Option<TaskId>,
    outcome: Option<ChildOutcome>,
}

impl PauseSlot {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pause until `child` reports, dropping anything an earlier child left.
    pub fn begin(&self, child: TaskId) {
        let mut state = self.lock();
        state.waiting_on = Some(child);
        state.outcome = None;
        self.paused.store(true, Ordering::Release);
    }

    /// Store `child`'s outcome and unpause. Returns false when the parent is
    /// not waiting on that child (it already timed out, or moved on).
    pub fn finish(&self, child: &TaskId, outcome: ChildOutcome) -> bool {
        let mut state = self.lock();
        if state.waiting_on.as_ref() != Some(child) {
            return false;
        }
        state.waiting_on = None;
        state.outcome = Some(outcome);
        self.paused.store(false, Ordering::Release);
        true
    }

    pub fn take(&self) -> Option<ChildOutcome> {
        self.lock().outcome.take()
    }
}

/// Registry entry for a running task. Cheap to clone.
#[derive(Clone)]
pub struct TaskHandle {
    pub task_id: TaskId,
    pub instance_id: String,
    pub parent_id: Option<TaskId>,
    /// Mode the task runs in.
    pub mode: String,
    pub messenger: Arc<Messenger>,
    pub cancel: CancellationToken,
    pub(crate) pause: Arc<PauseSlot>,
}

impl TaskHandle {
    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }
}

/// A started task: its identity and the join handle of its loop.
pub struct TaskRun {
    pub task_id: TaskId,
    pub instance_id: String,
    pub join: JoinHandle<TaskOutcome>,
}

impl TaskRun {
    /// Wait for the loop to end.
    pub async fn wait(self) -> TaskOutcome {
        self.join.await.unwrap_or_else(|e| TaskOutcome::Aborted {
            reason: format!("task loop panicked: {e}"),
        })
    }
}

/// How the loop should begin.
pub(crate) enum Start {
    New { text: String, images: Vec<String> },
    Resume,
}

/// The loop-owned state of one task.
pub struct Task {
    pub id: TaskId,
    pub instance_id: String,
    pub parent_id: Option<TaskId>,
    pub mode: Mode,
    pub api_history: Vec<ApiMessage>,
    pub messenger: Arc<Messenger>,
    pub checkpoints: CheckpointManager,
    pub ctx: ToolContext,
    /// Consecutive mistakes since the last successful tool call.
    pub mistakes: u32,
    /// Accounting of the previous request; drives truncation.
    pub last_accounting: TokenAccounting,
    pub(crate) pause: Arc<PauseSlot>,
}

impl Task {
    pub fn cancel(&self) -> &CancellationToken {
        self.messenger.cancel_token()
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            task_id: self.id.clone(),
            instance_id: self.instance_id.clone(),
            parent_id: self.parent_id.clone(),
            mode: self.mode.slug.clone(),
            messenger: self.messenger.clone(),
            cancel: self.cancel().clone(),
            pause: self.pause.clone(),
        }
    }

    /// Append a user turn stamped from the task clock.
    pub fn push_user(&mut self, content: Vec<ContentPart>) {
        let mut message = ApiMessage::user_parts(content);
        message.ts = self.messenger.next_ts();
        self.api_history.push(message);
    }

    /// Append an assistant turn with a timestamp reserved earlier.
    pub fn push_assistant(&mut self, text: impl Into<String>, ts: i64) {
        let mut message = ApiMessage::assistant(text);
        message.ts = ts;
        self.api_history.push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_slot_handshake() {
        let slot = PauseSlot::default();
        let child = TaskId::from("child");
        assert!(!slot.is_paused());

        slot.begin(child.clone());
        assert!(slot.is_paused());
        assert!(slot.take().is_none());

        let done = ChildOutcome::Finished(TaskOutcome::Completed { result: "done".into() });
        assert!(slot.finish(&child, done));
        assert!(!slot.is_paused());
        assert_eq!(
            slot.take().map(|o| o.report()),
            Some("[new_task completed] Result: done".to_string())
        );
        assert!(slot.take().is_none());
    }

    #[test]
    fn late_child_cannot_fill_the_slot() {
        let slot = PauseSlot::default();
        let first = TaskId::from("first");
        let second = TaskId::from("second");

        slot.begin(first.clone());
        assert!(slot.finish(&first, ChildOutcome::TimedOut { secs: 5 }));
        slot.begin(second.clone());

        let late = ChildOutcome::Finished(TaskOutcome::Aborted { reason: "aborted".into() });
        assert!(!slot.finish(&first, late));
        assert!(slot.is_paused());
        assert!(slot.take().is_none());
    }

    #[test]
    fn reports_name_the_outcome() {
        let timed_out = ChildOutcome::TimedOut { secs: 3600 }.report();
        assert!(timed_out.contains("3600 seconds"));

        let aborted = ChildOutcome::Finished(TaskOutcome::Aborted { reason: "user abort".into() }).report();
        assert!(aborted.starts_with("[new_task aborted]"));
        assert!(aborted.contains("user abort"));
    }
}
