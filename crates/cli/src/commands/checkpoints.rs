//! `tasklane checkpoints`: list, diff or restore a task's checkpoints.

use std::path::PathBuf;
use std::sync::Arc;
use tasklane_agent::{ChangeKind, Checkpoint, RestoreMode, Runtime};
use tasklane_config::AppConfig;
use tasklane_core::message::TaskId;
use tasklane_providers::ScriptedProvider;
use tasklane_store::FileTaskStore;

/// Pick the checkpoint whose hash starts with `prefix`.
pub fn find<'a>(checkpoints: &'a [Checkpoint], prefix: &str) -> Result<&'a Checkpoint, String> {
    let mut matches = checkpoints.iter().filter(|c| c.hash.starts_with(prefix));
    match (matches.next(), matches.next()) {
        (Some(c), None) => Ok(c),
        (None, _) => Err(format!("no checkpoint matches '{prefix}'")),
        (Some(_), Some(_)) => Err(format!("'{prefix}' matches more than one checkpoint")),
    }
}

fn when(ts: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts)
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

pub async fn run(
    task_id: String,
    restore: Option<String>,
    mode: RestoreMode,
    workspace: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let workspace = workspace.unwrap_or_else(AppConfig::workspace_dir);
    let store = Arc::new(FileTaskStore::new(config.storage.tasks_dir()));
    // Checkpoint commands never call the model
    let provider = Arc::new(ScriptedProvider::new(Vec::new()));
    let runtime = Arc::new(Runtime::new(config, provider, store, workspace));

    let task_id = TaskId::from(&task_id);
    let checkpoints = runtime.list_checkpoints(&task_id).await?;
    if checkpoints.is_empty() {
        println!("Task {task_id} has no checkpoints.");
        return Ok(());
    }

    if let Some(prefix) = restore {
        let target = find(&checkpoints, &prefix)?.clone();
        runtime.restore_checkpoint(&task_id, &target.hash, mode).await?;
        println!("Restored {} ({}) with {mode:?}", &target.hash[..target.hash.len().min(12)], when(target.ts));
        return Ok(());
    }

    println!("Checkpoints of task {task_id}:");
    for (i, checkpoint) in checkpoints.iter().enumerate() {
        let changes = runtime.diff_checkpoint(&task_id, &checkpoint.hash).await?;
        let count = |kind: ChangeKind| changes.iter().filter(|c| c.kind == kind).count();
        println!(
            "  {:>2}. {}  {}  vs workspace: +{} ~{} -{}",
            i + 1,
            &checkpoint.hash[..checkpoint.hash.len().min(12)],
            when(checkpoint.ts),
            count(ChangeKind::Added),
            count(ChangeKind::Modified),
            count(ChangeKind::Deleted),
        );
    }
    println!("\nRestore one with: tasklane checkpoints {task_id} --restore <hash>");
    Ok(())
}
