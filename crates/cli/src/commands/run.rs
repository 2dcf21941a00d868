//! `tasklane run` / `tasklane resume`: drive a task from the terminal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tasklane_agent::{Runtime, TaskOutcome, TaskRun};
use tasklane_channels::ipc::{self, FileMailbox, IpcNotifier};
use tasklane_channels::{NotificationBridge, TelegramBridge, TerminalResponder};
use tasklane_config::{AppConfig, AutoApproveConfig};
use tasklane_core::message::TaskId;
use tasklane_core::provider::Provider;
use tasklane_providers::ScriptedProvider;
use tasklane_store::FileTaskStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const REPLY_POLL: Duration = Duration::from_secs(2);

pub struct Options {
    pub workspace: Option<PathBuf>,
    pub script: Option<PathBuf>,
    pub auto_approve: bool,
}

/// Load config and assemble a runtime over the file store.
pub fn build_runtime(opts: &Options) -> Result<Arc<Runtime>, Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if opts.auto_approve {
        config.auto_approve = AutoApproveConfig::all();
    }
    let workspace = opts.workspace.clone().unwrap_or_else(AppConfig::workspace_dir);
    let workspace = workspace.canonicalize().unwrap_or(workspace);

    let provider: Arc<dyn Provider> = match &opts.script {
        Some(path) => Arc::new(ScriptedProvider::from_file(path)?),
        None => tasklane_providers::from_config(&config)?,
    };
    let store = Arc::new(FileTaskStore::new(config.storage.tasks_dir()));
    Ok(Arc::new(Runtime::new(config, provider, store, workspace)))
}

/// Start the configured bridge transport next to the terminal.
pub fn start_bridge(runtime: &Arc<Runtime>, cancel: &CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
    let config = runtime.config().bridge.clone();
    if !config.enabled {
        return Ok(());
    }
    let bridge = Arc::new(NotificationBridge::new(runtime.clone()));
    let events = runtime.events().subscribe();

    match config.transport.as_str() {
        "telegram" => {
            let telegram = Arc::new(TelegramBridge::from_config(&config, bridge.clone())?);
            tokio::spawn(bridge.run(events, telegram.clone(), cancel.child_token()));
            tokio::spawn(telegram.run(cancel.child_token()));
            info!("Telegram bridge started");
        }
        "ipc" => {
            let mailbox = FileMailbox::new(config.ipc_dir());
            let notifier = Arc::new(IpcNotifier::new(mailbox.clone(), ipc::notify_channel(&config.ipc_prefix)));
            tokio::spawn(bridge.clone().run(events, notifier, cancel.child_token()));

            let replies = ipc::response_channel(&config.ipc_prefix);
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                ipc::forward_replies(&mailbox, &replies, bridge.as_ref(), REPLY_POLL, &cancel).await;
            });
            info!(dir = %config.ipc_dir().display(), "IPC bridge started");
        }
        other => warn!(transport = other, "Unknown bridge transport, bridge disabled"),
    }
    Ok(())
}

/// Attach the terminal and the bridge. Done before the task starts so no
/// early ask is missed.
fn serve(runtime: &Arc<Runtime>) -> Result<CancellationToken, Box<dyn std::error::Error>> {
    let cancel = CancellationToken::new();
    let terminal = TerminalResponder::new(runtime.clone());
    let events = runtime.events().subscribe();
    let terminal_cancel = cancel.child_token();
    tokio::spawn(async move { terminal.run(events, terminal_cancel).await });
    start_bridge(runtime, &cancel)?;
    Ok(cancel)
}

/// Wait for the task to end. Ctrl-C aborts it.
async fn finish(runtime: Arc<Runtime>, run: TaskRun, cancel: CancellationToken) -> bool {
    let rt = runtime.clone();
    let task_id = run.task_id.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(task_id = %task_id, "Interrupted, aborting task");
            rt.abort(&task_id);
        }
    });

    let task_id = run.task_id.clone();
    let outcome = run.wait().await;
    cancel.cancel();

    match outcome {
        TaskOutcome::Completed { result } => {
            println!("\nTask {task_id} completed:\n{result}");
            true
        }
        TaskOutcome::Aborted { reason } => {
            println!("\nTask {task_id} aborted: {reason}");
            println!("Continue it with: tasklane resume {task_id}");
            false
        }
    }
}

pub async fn run(task: String, mode: Option<String>, opts: Options) -> Result<bool, Box<dyn std::error::Error>> {
    let runtime = build_runtime(&opts)?;
    let cancel = serve(&runtime)?;
    let run = runtime.start_task(task, Vec::new(), mode.as_deref())?;
    println!("Task {} started in {}", run.task_id, runtime.workspace().display());
    Ok(finish(runtime, run, cancel).await)
}

pub async fn resume(task_id: String, opts: Options) -> Result<bool, Box<dyn std::error::Error>> {
    let runtime = build_runtime(&opts)?;
    let cancel = serve(&runtime)?;
    let run = runtime.resume_task(&TaskId::from(&task_id)).await?;
    println!("Resuming task {}", run.task_id);
    Ok(finish(runtime, run, cancel).await)
}
