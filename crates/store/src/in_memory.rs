//! In-memory task store. Nothing survives the process.

use async_trait::async_trait;
use std::collections::HashMap;
use tasklane_core::error::StoreError;
use tasklane_core::message::{ApiMessage, TaskId, UiMessage};
use tasklane_core::store::{HistoryItem, TaskSnapshot, TaskStore};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, TaskSnapshot>>,
    index: RwLock<Vec<HistoryItem>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a task, e.g. to test resumption.
    pub async fn insert(&self, task_id: TaskId, snapshot: TaskSnapshot) {
        self.tasks.write().await.insert(task_id, snapshot);
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn load(&self, task_id: &TaskId) -> Result<TaskSnapshot, StoreError> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))
    }

    async fn save(
        &self,
        task_id: &TaskId,
        api_history: &[ApiMessage],
        ui_messages: &[UiMessage],
    ) -> Result<(), StoreError> {
        self.tasks.write().await.insert(
            task_id.clone(),
            TaskSnapshot {
                api_history: api_history.to_vec(),
                ui_messages: ui_messages.to_vec(),
            },
        );
        Ok(())
    }

    async fn save_history_item(&self, item: &HistoryItem) -> Result<(), StoreError> {
        let mut index = self.index.write().await;
        match index.iter_mut().find(|i| i.task_id == item.task_id) {
            Some(existing) => *existing = item.clone(),
            None => index.push(item.clone()),
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<HistoryItem>, StoreError> {
        let mut items = self.index.read().await.clone();
        items.sort_by(|a, b| b.ts.cmp(&a.ts));
        Ok(items)
    }

    async fn delete(&self, task_id: &TaskId) -> Result<(), StoreError> {
        self.tasks.write().await.remove(task_id);
        self.index.write().await.retain(|i| &i.task_id != task_id);
        Ok(())
    }
}
