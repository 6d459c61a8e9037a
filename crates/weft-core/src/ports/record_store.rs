//! ExecutionRecordStore port - key ごとの実行記録
//!
//! # 契約
//! - `claim` は単一のアトミック操作でなければならない（read→write の 2 手は不可）
//! - `complete` / `release` は claim の持ち主（ClaimId）だけが実行できる
//! - Completed の result は書き換え不可（write-once）
//! - 期限切れの Pending は `reclaim` で回収できる（クラッシュしたワーカー対策）
//!
//! # 実装
//! - `MetadataRecordStore<S: TaskStore>`: task metadata の CAS 更新
//! - `SqliteRecordStore`: 主キー制約 + `INSERT ... ON CONFLICT DO NOTHING`

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{ClaimId, ExecutionRecord, IdempotencyKey, StoreError, TaskId};

/// Result of `claim`.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// A new Pending record was created; the caller owns it.
    Claimed(ClaimId),
    /// A record (pending or completed) already exists; nothing was written.
    Held(ExecutionRecord),
}

#[async_trait]
pub trait ExecutionRecordStore: Send + Sync {
    async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<ExecutionRecord>, StoreError>;

    /// Create a Pending record for `key` iff no record exists.
    async fn claim(&self, key: &IdempotencyKey) -> Result<ClaimOutcome, StoreError>;

    /// Pending (held by `claim_id`) -> Completed with `result`.
    ///
    /// Fails with `StoreError::NotClaimed` if the record is missing, already
    /// completed, or held by another claim.
    async fn complete(
        &self,
        key: &IdempotencyKey,
        claim_id: &ClaimId,
        result: serde_json::Value,
    ) -> Result<ExecutionRecord, StoreError>;

    /// Drop the caller's own Pending record after its action failed.
    /// Returns false if there was nothing of ours to drop.
    async fn release(&self, key: &IdempotencyKey, claim_id: &ClaimId) -> Result<bool, StoreError>;

    /// Drop a Pending record whose lease has expired. Returns whether one was dropped.
    async fn reclaim(
        &self,
        key: &IdempotencyKey,
        lease_timeout: Duration,
    ) -> Result<bool, StoreError>;

    /// Remove every record of a task; returns how many were removed.
    async fn clear_all(&self, task_id: &TaskId) -> Result<usize, StoreError>;

    async fn records(&self, task_id: &TaskId) -> Result<Vec<ExecutionRecord>, StoreError>;
}
