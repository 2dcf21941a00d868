//! Checkpoint manager: content-addressed workspace snapshots around mutating
//! tool calls, with diff and destructive restore.
//!
//! Checkpointing is best effort. A backend that is not ready within the init
//! timeout, or that fails a save, disables checkpointing for the rest of the
//! task; the task itself carries on.

pub mod shadow;

pub use shadow::ShadowStore;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tasklane_core::error::CheckpointError;
use tasklane_core::event::{DomainEvent, EventBus};
use tasklane_core::message::{ApiMessage, MessageKind, SayKind, TaskId, UiMessage};
use tracing::{debug, info, warn};

use crate::messenger::Messenger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// One file's difference between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
    pub before: Option<String>,
    pub after: Option<String>,
}

/// Storage for snapshots. Hashes are opaque to the manager.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    async fn init(&self) -> Result<(), CheckpointError>;

    async fn snapshot(&self, label: &str, parent: Option<&str>) -> Result<String, CheckpointError>;

    /// Changes from `from` to `to`, or to the live workspace when `to` is `None`.
    async fn diff(&self, from: &str, to: Option<&str>) -> Result<Vec<FileChange>, CheckpointError>;

    async fn restore(&self, hash: &str) -> Result<(), CheckpointError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub hash: String,
    pub parent_hash: Option<String>,
    /// Timestamp of the `checkpoint_saved` message; both logs are cut here on restore.
    pub ts: i64,
}

/// What a restore rewinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    FilesOnly,
    TaskOnly,
    #[default]
    FilesAndTask,
}

impl RestoreMode {
    fn files(self) -> bool {
        matches!(self, Self::FilesOnly | Self::FilesAndTask)
    }

    fn task(self) -> bool {
        matches!(self, Self::TaskOnly | Self::FilesAndTask)
    }
}

impl FromStr for RestoreMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "files_only" | "files" => Ok(Self::FilesOnly),
            "task_only" | "task" => Ok(Self::TaskOnly),
            "files_and_task" | "all" => Ok(Self::FilesAndTask),
            other => Err(format!("unknown restore mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendState {
    Uninitialized,
    Ready,
    Disabled,
}

pub struct CheckpointManager {
    task_id: TaskId,
    backend: Option<Arc<dyn SnapshotBackend>>,
    state: BackendState,
    init_timeout: Duration,
    checkpoints: Vec<Checkpoint>,
    events: Arc<EventBus>,
}

impl CheckpointManager {
    pub fn new(
        task_id: TaskId,
        backend: Arc<dyn SnapshotBackend>,
        init_timeout: Duration,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            task_id,
            backend: Some(backend),
            state: BackendState::Uninitialized,
            init_timeout,
            checkpoints: Vec::new(),
            events,
        }
    }

    /// A manager that never snapshots.
    pub fn disabled(task_id: TaskId) -> Self {
        Self {
            task_id,
            backend: None,
            state: BackendState::Disabled,
            init_timeout: Duration::ZERO,
            checkpoints: Vec::new(),
            events: Arc::new(EventBus::new(1)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state != BackendState::Disabled
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Rebuild the checkpoint list from `checkpoint_saved` messages in a
    /// stored UI log.
    pub fn recover(&mut self, messages: &[UiMessage]) {
        self.checkpoints.clear();
        for message in messages {
            if message.kind != MessageKind::from(SayKind::CheckpointSaved) {
                continue;
            }
            let Some(hash) = message.text.clone() else { continue };
            let parent_hash = self.checkpoints.last().map(|c| c.hash.clone());
            self.checkpoints.push(Checkpoint { hash, parent_hash, ts: message.ts });
        }
    }

    /// Start the backend. Returns whether checkpointing is available.
    pub async fn init(&mut self) -> bool {
        if self.state != BackendState::Uninitialized {
            return self.is_enabled();
        }
        let Some(backend) = self.backend.clone() else {
            self.state = BackendState::Disabled;
            return false;
        };

        match tokio::time::timeout(self.init_timeout, backend.init()).await {
            Ok(Ok(())) => {
                debug!(task_id = %self.task_id, "Checkpoint backend ready");
                self.state = BackendState::Ready;
            }
            Ok(Err(e)) => {
                warn!(task_id = %self.task_id, error = %e, "Checkpoint init failed, checkpoints disabled");
                self.state = BackendState::Disabled;
            }
            Err(_) => {
                let err = CheckpointError::InitTimeout(self.init_timeout.as_secs());
                warn!(task_id = %self.task_id, error = %err, "Checkpoints disabled");
                self.state = BackendState::Disabled;
            }
        }
        self.is_enabled()
    }

    /// Take the initial snapshot if none exists yet. Called before the first
    /// mutating tool runs.
    pub async fn ensure_initial(&mut self, messenger: &Messenger) {
        if self.checkpoints.is_empty() {
            self.save("initial", messenger).await;
        }
    }

    /// Snapshot the workspace. Returns the new hash, or `None` when
    /// checkpointing is off or nothing changed since the last checkpoint.
    pub async fn save(&mut self, label: &str, messenger: &Messenger) -> Option<String> {
        if !self.init().await {
            return None;
        }
        let backend = self.backend.clone()?;
        let parent = self.checkpoints.last().map(|c| c.hash.clone());

        match backend.snapshot(label, parent.as_deref()).await {
            Ok(hash) if parent.as_deref() == Some(hash.as_str()) => {
                debug!(task_id = %self.task_id, hash = %hash, "Workspace unchanged, no new checkpoint");
                None
            }
            Ok(hash) => {
                let ts = messenger.say(SayKind::CheckpointSaved, &hash);
                self.checkpoints.push(Checkpoint {
                    hash: hash.clone(),
                    parent_hash: parent,
                    ts,
                });
                self.events.publish(DomainEvent::CheckpointSaved {
                    task_id: self.task_id.clone(),
                    hash: hash.clone(),
                    timestamp: Utc::now(),
                });
                debug!(task_id = %self.task_id, hash = %hash, label, "Checkpoint saved");
                Some(hash)
            }
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "Checkpoint save failed, checkpoints disabled");
                self.state = BackendState::Disabled;
                None
            }
        }
    }

    /// Changes from checkpoint `from` to checkpoint `to` (or the live workspace).
    pub async fn diff(&mut self, from: &str, to: Option<&str>) -> Result<Vec<FileChange>, CheckpointError> {
        if !self.init().await {
            return Err(CheckpointError::Disabled);
        }
        let backend = self.backend.clone().ok_or(CheckpointError::Disabled)?;
        backend.diff(from, to).await
    }

    /// Rewind to `hash`.
    ///
    /// Files: the workspace is reset to the snapshot. Task: model history
    /// keeps entries at or before the checkpoint, the UI log is cut to match,
    /// and later checkpoints are discarded.
    pub async fn restore(
        &mut self,
        hash: &str,
        mode: RestoreMode,
        history: &mut Vec<ApiMessage>,
        messenger: &Messenger,
    ) -> Result<(), CheckpointError> {
        let index = self
            .checkpoints
            .iter()
            .position(|c| c.hash == hash)
            .ok_or_else(|| CheckpointError::NotFound(hash.to_string()))?;
        let ts = self.checkpoints[index].ts;

        if mode.files() {
            if !self.init().await {
                return Err(CheckpointError::Disabled);
            }
            let backend = self.backend.clone().ok_or(CheckpointError::Disabled)?;
            backend.restore(hash).await?;
        }

        if mode.task() {
            history.retain(|m| m.ts <= ts);
            messenger.truncate_after(ts);
            self.checkpoints.truncate(index + 1);
        }

        info!(task_id = %self.task_id, hash = %hash, mode = ?mode, "Checkpoint restored");
        Ok(())
    }
}
