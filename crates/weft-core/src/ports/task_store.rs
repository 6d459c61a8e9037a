//! TaskStore port - タスクの正本（外部コラボレータ）
//!
//! タスク本体はこのクレートの外で管理されます。ここで必要なのは
//! タスクごとの metadata（JSON オブジェクト）の読み書きだけです。
//!
//! # 設計原則
//! - 書き込みは version による compare-and-swap（条件付き更新）
//! - 読んで、書き換えて、上書きする、を無条件に行ってはいけない
//!   （同時に claim した 2 ワーカーが両方とも「未実行」を見てしまう）

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::domain::{StoreError, TaskId};

/// A snapshot of a task's metadata at some version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskMetadata {
    /// Monotonic version, bumped by every applied update. 0 means "never written".
    pub version: u64,
    pub values: Map<String, Value>,
}

/// Result of a conditional metadata update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied { version: u64 },
    /// Someone else wrote first; nothing was changed.
    VersionMismatch { current: u64 },
}

/// TaskStore は metadata の正本
///
/// An unknown task reads as version 0 with empty metadata, and an update
/// expecting version 0 creates it.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_metadata(&self, task_id: &TaskId) -> Result<TaskMetadata, StoreError>;

    /// Replace the metadata iff its current version equals `expected_version`.
    async fn update_metadata(
        &self,
        task_id: &TaskId,
        expected_version: u64,
        values: Map<String, Value>,
    ) -> Result<CasOutcome, StoreError>;
}

#[async_trait]
impl<T: TaskStore + ?Sized> TaskStore for std::sync::Arc<T> {
    async fn get_metadata(&self, task_id: &TaskId) -> Result<TaskMetadata, StoreError> {
        (**self).get_metadata(task_id).await
    }

    async fn update_metadata(
        &self,
        task_id: &TaskId,
        expected_version: u64,
        values: Map<String, Value>,
    ) -> Result<CasOutcome, StoreError> {
        (**self)
            .update_metadata(task_id, expected_version, values)
            .await
    }
}
