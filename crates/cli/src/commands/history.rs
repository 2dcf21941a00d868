//! `tasklane history`: list stored tasks.

use tasklane_config::AppConfig;
use tasklane_core::store::{HistoryItem, TaskStore};
use tasklane_store::FileTaskStore;

/// First line of the task text, cut to `width` characters.
pub fn headline(task: &str, width: usize) -> String {
    let line = task.lines().next().unwrap_or_default();
    if line.chars().count() <= width {
        line.to_string()
    } else {
        let cut: String = line.chars().take(width.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

fn row(item: &HistoryItem) -> String {
    let when = chrono::DateTime::from_timestamp_millis(item.ts)
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default();
    let task = match &item.parent_id {
        Some(parent) => format!("↳ {} (sub-task of {})", headline(&item.task, 40), parent.short()),
        None => headline(&item.task, 60),
    };
    format!(
        "{}  {}  {:<12} {:>8} in {:>7} out  ${:.4}  {}",
        item.task_id.short(),
        when,
        item.mode,
        item.tokens_in,
        item.tokens_out,
        item.total_cost,
        task
    )
}

pub async fn run(limit: usize) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let store = FileTaskStore::new(config.storage.tasks_dir());
    let mut items = store.list().await?;
    if items.is_empty() {
        println!("No tasks yet. Start one with: tasklane run \"<task>\"");
        return Ok(());
    }
    items.sort_by(|a, b| b.ts.cmp(&a.ts));

    println!("Tasks in {}:", config.storage.tasks_dir().display());
    for item in items.iter().take(limit) {
        println!("{}", row(item));
    }
    if items.len() > limit {
        println!("... {} more (use -n to show them)", items.len() - limit);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headline_cuts_long_tasks() {
        assert_eq!(headline("short\nsecond line", 10), "short");
        assert_eq!(headline("abcdefghijkl", 8), "abcde...");
    }
}
