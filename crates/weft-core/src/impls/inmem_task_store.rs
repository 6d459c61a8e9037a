//! InMemoryTaskStore - 開発・テスト用のタスクストア
//!
//! # 実装詳細
//! - HashMap<TaskId, TaskMetadata> を tokio Mutex で排他制御
//! - update_metadata は version 一致時のみ反映（CAS）
//! - `set_available(false)` でストア障害を再現できる

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::domain::{StoreError, TaskId};
use crate::ports::{CasOutcome, TaskMetadata, TaskStore};

pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<TaskId, TaskMetadata>>,
    available: AtomicBool,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every call fails with `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(
                "in-memory task store is switched off".to_string(),
            ))
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get_metadata(&self, task_id: &TaskId) -> Result<TaskMetadata, StoreError> {
        self.ensure_available()?;
        let tasks = self.tasks.lock().await;
        Ok(tasks.get(task_id).cloned().unwrap_or_default())
    }

    async fn update_metadata(
        &self,
        task_id: &TaskId,
        expected_version: u64,
        values: Map<String, Value>,
    ) -> Result<CasOutcome, StoreError> {
        self.ensure_available()?;
        let mut tasks = self.tasks.lock().await;
        let current = tasks.get(task_id).map_or(0, |m| m.version);
        if current != expected_version {
            return Ok(CasOutcome::VersionMismatch { current });
        }
        let version = current + 1;
        tasks.insert(task_id.clone(), TaskMetadata { version, values });
        Ok(CasOutcome::Applied { version })
    }
}
