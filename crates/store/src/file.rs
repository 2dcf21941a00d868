//! File-based task store.
//!
//! Layout under the tasks directory:
//!
//! ```text
//! history.jsonl                          one HistoryItem per line
//! <task_id>/api_conversation_history.json
//! <task_id>/ui_messages.json
//! ```
//!
//! The index is loaded into memory on creation and flushed to disk on every
//! mutation. Conversation files are rewritten whole on every save.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tasklane_core::error::StoreError;
use tasklane_core::message::{ApiMessage, TaskId, UiMessage};
use tasklane_core::store::{HistoryItem, TaskSnapshot, TaskStore};
use tokio::sync::RwLock;
use tracing::{debug, warn};

const API_HISTORY_FILE: &str = "api_conversation_history.json";
const UI_MESSAGES_FILE: &str = "ui_messages.json";
const INDEX_FILE: &str = "history.jsonl";

pub struct FileTaskStore {
    root: PathBuf,
    index: Arc<RwLock<Vec<HistoryItem>>>,
}

impl FileTaskStore {
    /// Open (or lazily create) a store rooted at `root`.
    pub fn new(root: PathBuf) -> Self {
        let index = Self::load_index(&root.join(INDEX_FILE));
        debug!(root = %root.display(), tasks = index.len(), "File task store opened");
        Self {
            root,
            index: Arc::new(RwLock::new(index)),
        }
    }

    pub fn task_dir(&self, task_id: &TaskId) -> PathBuf {
        self.root.join(&task_id.0)
    }

    fn load_index(path: &Path) -> Vec<HistoryItem> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<HistoryItem>(line) {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!(error = %e, "Skipping corrupted history entry");
                    None
                }
            })
            .collect()
    }

    async fn flush_index(&self) -> Result<(), StoreError> {
        let index = self.index.read().await;
        let path = self.root.join(INDEX_FILE);

        let mut content = String::new();
        for item in index.iter() {
            let line = serde_json::to_string(item).map_err(|e| corrupt(&path, e))?;
            content.push_str(&line);
            content.push('\n');
        }

        write_file(&path, content.as_bytes()).await
    }
}

fn io_error(path: &Path, e: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

fn corrupt(path: &Path, e: serde_json::Error) -> StoreError {
    StoreError::Corrupt {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(parent, e))?;
    }
    // Write then rename so a crash never leaves half a file behind
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await.map_err(|e| io_error(&tmp, e))?;
    tokio::fs::rename(&tmp, path).await.map_err(|e| io_error(path, e))
}

async fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| corrupt(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(io_error(path, e)),
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn load(&self, task_id: &TaskId) -> Result<TaskSnapshot, StoreError> {
        let dir = self.task_dir(task_id);
        if !dir.exists() {
            return Err(StoreError::NotFound(task_id.to_string()));
        }
        Ok(TaskSnapshot {
            api_history: read_json(&dir.join(API_HISTORY_FILE)).await?,
            ui_messages: read_json(&dir.join(UI_MESSAGES_FILE)).await?,
        })
    }

    async fn save(
        &self,
        task_id: &TaskId,
        api_history: &[ApiMessage],
        ui_messages: &[UiMessage],
    ) -> Result<(), StoreError> {
        let dir = self.task_dir(task_id);
        let api_path = dir.join(API_HISTORY_FILE);
        let ui_path = dir.join(UI_MESSAGES_FILE);

        let api = serde_json::to_vec(api_history).map_err(|e| corrupt(&api_path, e))?;
        let ui = serde_json::to_vec(ui_messages).map_err(|e| corrupt(&ui_path, e))?;
        write_file(&api_path, &api).await?;
        write_file(&ui_path, &ui).await?;

        debug!(task_id = %task_id, api = api_history.len(), ui = ui_messages.len(), "Task saved");
        Ok(())
    }

    async fn save_history_item(&self, item: &HistoryItem) -> Result<(), StoreError> {
        {
            let mut index = self.index.write().await;
            match index.iter_mut().find(|i| i.task_id == item.task_id) {
                Some(existing) => *existing = item.clone(),
                None => index.push(item.clone()),
            }
        }
        self.flush_index().await
    }

    async fn list(&self) -> Result<Vec<HistoryItem>, StoreError> {
        let mut items = self.index.read().await.clone();
        items.sort_by(|a, b| b.ts.cmp(&a.ts));
        Ok(items)
    }

    async fn delete(&self, task_id: &TaskId) -> Result<(), StoreError> {
        let dir = self.task_dir(task_id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|e| io_error(&dir, e))?;
        }
        self.index.write().await.retain(|i| &i.task_id != task_id);
        self.flush_index().await
    }
}
