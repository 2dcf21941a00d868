//! The runtime: owns every running task and the `task_id → handle`
//! registry used for lookup by id.
//!
//! Each task loop runs on its own tokio task. A child task gets a child
//! cancellation token, so aborting a parent aborts its running descendants.
//! Responders (terminal, bridge, UI) reach a pending ask only through
//! [`AskResponder::respond`] on the runtime.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tasklane_config::AppConfig;
use tasklane_core::channel::{AskResponder, Resolution};
use tasklane_core::error::{AskError, Error, StoreError};
use tasklane_core::event::{DomainEvent, EventBus};
use tasklane_core::message::{AskResponse, TaskId, TokenAccounting, UiMessage};
use tasklane_core::mode::{Mode, find_mode};
use tasklane_core::provider::Provider;
use tasklane_core::store::{HistoryItem, TaskStore};
use tasklane_core::tool::{ToolContext, ToolRegistry};
use tasklane_telemetry::PricingTable;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointManager, FileChange, RestoreMode, ShadowStore};
use crate::dispatcher::Dispatcher;
use crate::messenger::Messenger;
use crate::parser::StreamParser;
use crate::task::{ChildOutcome, PauseSlot, Start, Task, TaskHandle, TaskOutcome, TaskRun};

pub struct Runtime {
    pub(crate) config: AppConfig,
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) tools: Arc<ToolRegistry>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) parser: StreamParser,
    pub(crate) pricing: PricingTable,
    pub(crate) events: Arc<EventBus>,
    pub(crate) workspace: PathBuf,
    pub(crate) modes: Vec<Mode>,
    registry: RwLock<HashMap<TaskId, TaskHandle>>,
    active_mode: Mutex<String>,
    pub(crate) last_request: Mutex<Option<Instant>>,
}

impl Runtime {
    /// Create a runtime with the built-in tools for the configured modes.
    pub fn new(
        config: AppConfig,
        provider: Arc<dyn Provider>,
        store: Arc<dyn TaskStore>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        let modes = config.modes();
        let tools = Arc::new(tasklane_tools::default_registry(&modes));
        let active_mode = config.default_mode.clone();
        Self {
            dispatcher: Dispatcher::new(tools.clone(), config.auto_approve.clone()),
            parser: StreamParser::from_registry(&tools),
            tools,
            config,
            provider,
            store,
            pricing: PricingTable::with_defaults(),
            events: Arc::new(EventBus::default()),
            workspace: workspace.into(),
            modes,
            registry: RwLock::new(HashMap::new()),
            active_mode: Mutex::new(active_mode),
            last_request: Mutex::new(None),
        }
    }

    /// Share an existing event bus (the bridge subscribes before tasks start).
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    /// Replace the tool set. The parser vocabulary follows.
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        let tools = Arc::new(tools);
        self.dispatcher = Dispatcher::new(tools.clone(), self.config.auto_approve.clone());
        self.parser = StreamParser::from_registry(&tools);
        self.tools = tools;
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// The mode the user-facing surface is in. Switches while a sub-task runs.
    pub fn active_mode(&self) -> String {
        self.active_mode.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_active_mode(&self, slug: &str) {
        let mut active = self.active_mode.lock().unwrap_or_else(|e| e.into_inner());
        if *active != slug {
            debug!(from = %active, to = %slug, "Switching active mode");
            *active = slug.to_string();
        }
    }

    // --- Registry ---

    pub fn handle(&self, task_id: &TaskId) -> Option<TaskHandle> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .cloned()
    }

    /// Handles of every running task.
    pub fn running(&self) -> Vec<TaskHandle> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn register(&self, handle: TaskHandle) {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.task_id.clone(), handle);
    }

    fn unregister(&self, task_id: &TaskId, instance_id: &str) {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        if registry.get(task_id).is_some_and(|h| h.instance_id == instance_id) {
            registry.remove(task_id);
        }
    }

    /// Abort a running task and, through its token, all of its descendants.
    pub fn abort(&self, task_id: &TaskId) -> bool {
        match self.handle(task_id) {
            Some(handle) => {
                info!(task_id = %task_id, "Aborting task");
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    // --- Lifecycle ---

    /// Start a new top-level task in `mode` (or the configured default).
    pub fn start_task(
        self: &Arc<Self>,
        text: impl Into<String>,
        images: Vec<String>,
        mode: Option<&str>,
    ) -> Result<TaskRun, Error> {
        let slug = mode.unwrap_or(&self.config.default_mode);
        let mode = find_mode(&self.modes, slug).cloned().ok_or_else(|| Error::Config {
            message: format!("unknown mode '{slug}'"),
        })?;
        self.set_active_mode(&mode.slug);

        let task = self.new_task(TaskId::new(), None, mode, CancellationToken::new(), Vec::new());
        Ok(self.launch(task, Start::New { text: text.into(), images }))
    }

    /// Start a task and wait for it to end.
    pub async fn run_task(
        self: &Arc<Self>,
        text: impl Into<String>,
        mode: Option<&str>,
    ) -> Result<TaskOutcome, Error> {
        Ok(self.start_task(text, Vec::new(), mode)?.wait().await)
    }

    /// Load a stored task and continue it under a new instance id.
    pub async fn resume_task(self: &Arc<Self>, task_id: &TaskId) -> Result<TaskRun, Error> {
        if self.handle(task_id).is_some() {
            return Err(Error::Internal(format!("task {task_id} is already running")));
        }
        let snapshot = self.store.load(task_id).await?;
        if snapshot.ui_messages.is_empty() {
            return Err(StoreError::NotFound(task_id.to_string()).into());
        }

        let item = self.history_item(task_id).await;
        let mode = item
            .as_ref()
            .and_then(|i| find_mode(&self.modes, &i.mode))
            .or_else(|| find_mode(&self.modes, &self.config.default_mode))
            .cloned()
            .ok_or_else(|| Error::Config {
                message: format!("unknown mode '{}'", self.config.default_mode),
            })?;
        // An orphaned sub-task resumes as a top-level task
        let parent_id = item
            .and_then(|i| i.parent_id)
            .filter(|p| self.handle(p).is_some());
        self.set_active_mode(&mode.slug);

        let mut task = self.new_task(
            task_id.clone(),
            parent_id,
            mode,
            CancellationToken::new(),
            snapshot.ui_messages,
        );
        task.api_history = snapshot.api_history;
        info!(task_id = %task_id, instance_id = %task.instance_id, "Resuming task");
        Ok(self.launch(task, Start::Resume))
    }

    async fn history_item(&self, task_id: &TaskId) -> Option<HistoryItem> {
        match self.store.list().await {
            Ok(items) => items.into_iter().find(|i| &i.task_id == task_id),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to read task index");
                None
            }
        }
    }

    fn new_task(
        &self,
        id: TaskId,
        parent_id: Option<TaskId>,
        mode: Mode,
        cancel: CancellationToken,
        messages: Vec<UiMessage>,
    ) -> Task {
        let instance_id = uuid::Uuid::new_v4().to_string();
        let messenger = Arc::new(
            Messenger::new(id.clone(), instance_id.clone(), self.events.clone(), cancel)
                .with_messages(messages),
        );
        let ctx = ToolContext {
            task_id: id.clone(),
            parent_id: parent_id.clone(),
            workspace: self.workspace.clone(),
            events: self.events.clone(),
            channel: messenger.clone(),
            command_timeout: Duration::from_secs(self.config.runtime.command_timeout_secs),
        };
        Task {
            checkpoints: self.checkpoint_manager(&id),
            id,
            instance_id,
            parent_id,
            mode,
            api_history: Vec::new(),
            messenger,
            ctx,
            mistakes: 0,
            last_accounting: TokenAccounting::default(),
            pause: Arc::new(PauseSlot::default()),
        }
    }

    fn checkpoint_manager(&self, task_id: &TaskId) -> CheckpointManager {
        let cfg = &self.config.checkpoints;
        if !cfg.enabled {
            return CheckpointManager::disabled(task_id.clone());
        }
        let backend = ShadowStore::new(
            self.workspace.clone(),
            &cfg.store_dir(),
            &task_id.0,
            cfg.exclude.clone(),
        );
        CheckpointManager::new(
            task_id.clone(),
            Arc::new(backend),
            Duration::from_secs(cfg.init_timeout_secs),
            self.events.clone(),
        )
    }

    fn launch(self: &Arc<Self>, task: Task, start: Start) -> TaskRun {
        let handle = task.handle();
        self.events.publish(DomainEvent::TaskStarted {
            task_id: handle.task_id.clone(),
            instance_id: handle.instance_id.clone(),
            parent_id: handle.parent_id.clone(),
            mode: handle.mode.clone(),
        });
        info!(task_id = %handle.task_id, mode = %handle.mode, parent = ?handle.parent_id, "Task started");
        let (task_id, instance_id) = (handle.task_id.clone(), handle.instance_id.clone());
        // Registered before the loop can run, so it can always unregister itself
        self.register(handle);
        TaskRun {
            task_id,
            instance_id,
            join: tokio::spawn(self.clone().drive(task, start)),
        }
    }

    /// Run one task to its end. Boxed so sub-tasks can be spawned from
    /// inside a running loop.
    fn drive(self: Arc<Self>, mut task: Task, start: Start) -> BoxFuture<'static, TaskOutcome> {
        Box::pin(async move {
            let outcome = self.run_loop(&mut task, start).await;
            self.persist(&task).await;

            match &outcome {
                TaskOutcome::Completed { result } => {
                    info!(task_id = %task.id, "Task completed");
                    self.events.publish(DomainEvent::TaskCompleted {
                        task_id: task.id.clone(),
                        instance_id: task.instance_id.clone(),
                        result: result.clone(),
                    });
                }
                TaskOutcome::Aborted { reason } => {
                    info!(task_id = %task.id, reason = %reason, "Task aborted");
                    self.events.publish(DomainEvent::TaskAborted {
                        task_id: task.id.clone(),
                        instance_id: task.instance_id.clone(),
                        reason: reason.clone(),
                    });
                }
            }

            if let Some(parent_id) = &task.parent_id {
                self.finish_child(parent_id, &task.id, ChildOutcome::Finished(outcome.clone()));
            }
            self.unregister(&task.id, &task.instance_id);
            outcome
        })
    }

    /// Save both logs and the index row. Failures are logged only.
    pub(crate) async fn persist(&self, task: &Task) {
        let messages = task.messenger.messages();
        if let Err(e) = self.store.save(&task.id, &task.api_history, &messages).await {
            warn!(task_id = %task.id, error = %e, "Failed to save task");
        }
        let item = HistoryItem::summarize(&task.id, &task.mode.slug, task.parent_id.as_ref(), &messages);
        if let Err(e) = self.store.save_history_item(&item).await {
            warn!(task_id = %task.id, error = %e, "Failed to save task index");
        }
    }

    // --- Sub-tasks ---

    /// Pause `parent`, run a child in `mode_slug`, and wait for it.
    pub(crate) async fn run_subtask(
        self: &Arc<Self>,
        parent: &Task,
        mode_slug: &str,
        message: &str,
    ) -> Result<ChildOutcome, AskError> {
        let Some(mode) = find_mode(&self.modes, mode_slug).cloned() else {
            return Ok(ChildOutcome::Finished(TaskOutcome::Aborted {
                reason: format!("unknown mode '{mode_slug}'"),
            }));
        };

        let child_id = TaskId::new();
        parent.pause.begin(child_id.clone());
        self.set_active_mode(&mode.slug);
        let child = self.new_task(
            child_id.clone(),
            Some(parent.id.clone()),
            mode,
            parent.cancel().child_token(),
            Vec::new(),
        );
        info!(task_id = %parent.id, child = %child_id, mode = %child.mode.slug, "Spawning sub-task");
        // The parent polls the pause flag; the join handle is not needed
        let _run = self.launch(child, Start::New { text: message.to_string(), images: Vec::new() });

        self.wait_for_child(parent, &child_id).await
    }

    async fn wait_for_child(&self, parent: &Task, child_id: &TaskId) -> Result<ChildOutcome, AskError> {
        let poll = Duration::from_millis(self.config.runtime.subtask_poll_interval_ms);
        let timeout_secs = self.config.runtime.subtask_timeout_secs;
        let deadline = Instant::now() + Duration::from_secs(timeout_secs);

        while parent.pause.is_paused() {
            if Instant::now() >= deadline {
                warn!(task_id = %parent.id, child = %child_id, timeout_secs, "Sub-task timed out, aborting it");
                self.abort(child_id);
                self.set_active_mode(&parent.mode.slug);
                parent.pause.finish(child_id, ChildOutcome::TimedOut { secs: timeout_secs });
                break;
            }
            tokio::select! {
                biased;
                _ = parent.cancel().cancelled() => return Err(AskError::Cancelled),
                _ = tokio::time::sleep(poll) => {}
            }
        }

        Ok(parent.pause.take().unwrap_or_else(|| {
            ChildOutcome::Finished(TaskOutcome::Aborted {
                reason: "the sub-task ended without reporting".into(),
            })
        }))
    }

    /// A child ended: restore the parent's mode and wake it.
    fn finish_child(&self, parent_id: &TaskId, child_id: &TaskId, outcome: ChildOutcome) {
        let Some(parent) = self.handle(parent_id) else {
            warn!(task_id = %child_id, parent = %parent_id, "Parent task is gone, dropping sub-task result");
            return;
        };
        if !parent.pause.finish(child_id, outcome) {
            debug!(task_id = %child_id, parent = %parent_id, "Parent no longer waiting on this sub-task");
            return;
        }
        self.set_active_mode(&parent.mode);
        debug!(task_id = %child_id, parent = %parent_id, "Sub-task result handed to parent");
    }

    // --- Checkpoints of stored tasks ---

    fn stopped_task(&self, task_id: &TaskId) -> Result<(), Error> {
        if self.handle(task_id).is_some() {
            return Err(Error::Internal(format!(
                "task {task_id} is running; abort it first"
            )));
        }
        Ok(())
    }

    /// Checkpoints recorded in a stored task's UI log.
    pub async fn list_checkpoints(&self, task_id: &TaskId) -> Result<Vec<Checkpoint>, Error> {
        let snapshot = self.store.load(task_id).await?;
        let mut manager = CheckpointManager::disabled(task_id.clone());
        manager.recover(&snapshot.ui_messages);
        Ok(manager.checkpoints().to_vec())
    }

    /// Changes from checkpoint `hash` to the live workspace.
    pub async fn diff_checkpoint(&self, task_id: &TaskId, hash: &str) -> Result<Vec<FileChange>, Error> {
        let mut manager = self.checkpoint_manager(task_id);
        Ok(manager.diff(hash, None).await?)
    }

    /// Rewind a stored task to `hash` and save the result.
    pub async fn restore_checkpoint(
        &self,
        task_id: &TaskId,
        hash: &str,
        mode: RestoreMode,
    ) -> Result<(), Error> {
        self.stopped_task(task_id)?;
        let snapshot = self.store.load(task_id).await?;
        let messenger = Messenger::new(
            task_id.clone(),
            "restore",
            self.events.clone(),
            CancellationToken::new(),
        )
        .with_messages(snapshot.ui_messages);
        let mut history = snapshot.api_history;

        let mut manager = self.checkpoint_manager(task_id);
        manager.recover(&messenger.messages());
        manager.restore(hash, mode, &mut history, &messenger).await?;

        self.store.save(task_id, &history, &messenger.messages()).await?;
        Ok(())
    }
}

impl AskResponder for Runtime {
    fn respond(&self, task_id: &TaskId, instance_id: &str, response: AskResponse) -> Resolution {
        let Some(handle) = self.handle(task_id) else {
            warn!(task_id = %task_id, "Ignoring response for a task that is not running");
            return Resolution::Stale;
        };
        if handle.instance_id != instance_id {
            warn!(
                task_id = %task_id,
                expected = %handle.instance_id,
                got = %instance_id,
                "Ignoring response for another instance of the task"
            );
            return Resolution::Stale;
        }
        handle.messenger.resolve(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasklane_core::message::AskKind;
    use tasklane_providers::ScriptedProvider;
    use tasklane_store::InMemoryTaskStore;

    fn runtime(dir: &Path, script: &[&str]) -> Arc<Runtime> {
        let mut config = AppConfig::default();
        config.checkpoints.enabled = false;
        config.runtime.retry_base_delay_secs = 0;
        let provider = Arc::new(ScriptedProvider::from_texts(script.iter().copied()));
        Arc::new(Runtime::new(config, provider, Arc::new(InMemoryTaskStore::new()), dir))
    }

    async fn wait_for_ask(runtime: &Runtime, task_id: &TaskId) -> (i64, AskKind) {
        for _ in 0..200 {
            if let Some(pending) = runtime.handle(task_id).and_then(|h| h.messenger.pending_ask()) {
                return pending;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no ask became pending");
    }

    #[tokio::test]
    async fn unknown_mode_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(dir.path(), &[]);
        assert!(rt.start_task("hi", Vec::new(), Some("debugger")).is_err());
    }

    #[tokio::test]
    async fn responder_must_match_instance() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(
            dir.path(),
            &["<attempt_completion><result>done</result></attempt_completion>"],
        );
        let run = rt.start_task("finish up", Vec::new(), None).unwrap();
        let (_, kind) = wait_for_ask(&rt, &run.task_id).await;
        assert_eq!(kind, AskKind::CompletionResult);

        assert_eq!(
            rt.respond(&run.task_id, "some-other-instance", AskResponse::approve()),
            Resolution::Stale
        );
        assert_eq!(
            rt.respond(&run.task_id, &run.instance_id, AskResponse::approve()),
            Resolution::Accepted
        );
        let instance = run.instance_id.clone();
        let task_id = run.task_id.clone();
        assert_eq!(
            run.wait().await,
            TaskOutcome::Completed { result: "done".into() }
        );
        assert!(rt.handle(&task_id).is_none());
        assert_eq!(rt.respond(&task_id, &instance, AskResponse::reject()), Resolution::Stale);
    }

    #[tokio::test]
    async fn abort_ends_a_waiting_task() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(
            dir.path(),
            &["<ask_followup_question><question>Which file?</question></ask_followup_question>"],
        );
        let run = rt.start_task("edit something", Vec::new(), None).unwrap();
        wait_for_ask(&rt, &run.task_id).await;

        assert!(rt.abort(&run.task_id));
        assert!(matches!(run.wait().await, TaskOutcome::Aborted { .. }));
        assert!(rt.running().is_empty());
    }
}
