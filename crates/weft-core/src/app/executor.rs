//! IdempotentExecutor - 副作用のある action を key ごとに高々 1 回だけ実行する
//!
//! # フロー
//! 1. `lookup(key)`: Completed ならキャッシュを返す（action は呼ばない）
//! 2. Pending で lease 切れなら `reclaim`（孤児 claim の回収）。ストアが回収を断ったら (3) へ
//! 3. Pending で lease 内なら ContentionPolicy に従う（待つ / ClaimConflict）
//! 4. 記録が無ければ `claim`。負けたら (1) からやり直し
//! 5. claim できたら action を実行
//!    - 成功: `complete`（result は JSON で保存）
//!    - 失敗: `release` して action のエラーをそのまま返す（失敗はキャッシュしない）
//!
//! 協調はすべてストアのアトミック操作で行い、executor 自身はロックを持ちません。

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::config::{ContentionPolicy, ExecutorConfig};
use crate::domain::{
    ClaimId, Executed, ExecuteError, ExecutionRecord, IdempotencyError, IdempotencyKey,
    StoreError, TaskId,
};
use crate::ports::{ClaimOutcome, Clock, ExecutionRecordStore, SystemClock};

pub struct IdempotentExecutor {
    store: Arc<dyn ExecutionRecordStore>,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
}

/// Where acquisition ended up.
enum Acquired<T> {
    Cached(T),
    Claimed(ClaimId),
}

impl IdempotentExecutor {
    /// Executor with the default configuration and the system clock.
    /// Use `ExecutorBuilder` for anything else.
    pub fn new(store: Arc<dyn ExecutionRecordStore>) -> Self {
        Self::from_parts(store, Arc::new(SystemClock), ExecutorConfig::default())
    }

    pub(crate) fn from_parts(
        store: Arc<dyn ExecutionRecordStore>,
        clock: Arc<dyn Clock>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionRecordStore> {
        &self.store
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run `action` at most once for `key`.
    ///
    /// Returns the fresh value (`was_cached = false`) or the value stored by
    /// an earlier successful run (`was_cached = true`). The action's own error
    /// comes back unchanged as `ExecuteError::Action` and is never cached.
    ///
    /// Dropping the returned future drops the action with it; the claim it
    /// held then stays Pending until its lease expires.
    pub async fn execute<T, E, F, Fut>(
        &self,
        key: &IdempotencyKey,
        action: F,
    ) -> Result<Executed<T>, ExecuteError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let claim_id = match self.acquire::<T>(key).await? {
            Acquired::Cached(value) => return Ok(Executed::cached(value)),
            Acquired::Claimed(claim_id) => claim_id,
        };
        debug!(key = %key, claim_id = %claim_id, "claimed, running action");

        let outcome = match self.config.action_timeout() {
            Some(limit) => match tokio::time::timeout(limit, action()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(key = %key, claim_id = %claim_id, timeout = ?limit, "action timed out");
                    self.release_claim(key, &claim_id).await;
                    return Err(IdempotencyError::ActionTimedOut {
                        key: key.to_string(),
                        timeout: limit,
                    }
                    .into());
                }
            },
            None => action().await,
        };

        let value = match outcome {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, claim_id = %claim_id, "action failed, releasing claim");
                self.release_claim(key, &claim_id).await;
                return Err(ExecuteError::Action(e));
            }
        };

        let encoded = match serde_json::to_value(&value) {
            Ok(encoded) => encoded,
            Err(source) => {
                self.release_claim(key, &claim_id).await;
                return Err(IdempotencyError::Codec {
                    key: key.to_string(),
                    source,
                }
                .into());
            }
        };

        match self.store.complete(key, &claim_id, encoded).await {
            Ok(_) => {
                debug!(key = %key, claim_id = %claim_id, "completed");
                Ok(Executed::fresh(value))
            }
            Err(StoreError::NotClaimed { claim_id, .. }) => {
                warn!(key = %key, claim_id = %claim_id, "claim was reclaimed while the action ran");
                Err(IdempotencyError::ClaimLost {
                    key: key.to_string(),
                    claim_id,
                }
                .into())
            }
            Err(e) => Err(IdempotencyError::from(e).into()),
        }
    }

    /// Remove every record of `task_id`; the next call with any of its keys
    /// runs the action again. Returns how many records were removed.
    pub async fn clear_cache(&self, task_id: &TaskId) -> Result<usize, IdempotencyError> {
        let removed = self.store.clear_all(task_id).await?;
        info!(task_id = %task_id, removed, "idempotency cache cleared");
        Ok(removed)
    }

    pub async fn lookup(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<ExecutionRecord>, IdempotencyError> {
        Ok(self.store.lookup(key).await?)
    }

    pub async fn records(&self, task_id: &TaskId) -> Result<Vec<ExecutionRecord>, IdempotencyError> {
        Ok(self.store.records(task_id).await?)
    }

    async fn acquire<T: DeserializeOwned>(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Acquired<T>, IdempotencyError> {
        let mut poll = 0u32;
        loop {
            let existing = match self.store.lookup(key).await? {
                Some(record) => record,
                None => match self.store.claim(key).await? {
                    ClaimOutcome::Claimed(claim_id) => return Ok(Acquired::Claimed(claim_id)),
                    ClaimOutcome::Held(record) => record,
                },
            };
            if let Some(value) = self.settle(key, existing, &mut poll).await? {
                return Ok(Acquired::Cached(value));
            }
        }
    }

    /// Handle a record found for `key`: the cached value if it is completed,
    /// `None` to go around again (after a reclaim or a backoff sleep).
    async fn settle<T: DeserializeOwned>(
        &self,
        key: &IdempotencyKey,
        record: ExecutionRecord,
        poll: &mut u32,
    ) -> Result<Option<T>, IdempotencyError> {
        if record.is_completed() {
            debug!(key = %key, "cache hit");
            return decode(key, record).map(Some);
        }

        // The store judges expiry by its own clock, so the two may disagree.
        // Only a successful reclaim skips the contention policy.
        let lease = self.config.lease_timeout();
        if record.lease_expired(self.clock.now(), lease) {
            if self.store.reclaim(key, lease).await? {
                warn!(
                    key = %key,
                    claim_id = %record.claim_id,
                    claimed_at = %record.claimed_at,
                    "reclaimed orphaned claim past its lease"
                );
                return Ok(None);
            }
            debug!(key = %key, claim_id = %record.claim_id, "store kept the claim, lease not over by its clock");
        }

        match self.config.contention {
            ContentionPolicy::Wait { max_polls } if *poll < max_polls => {
                let delay = self.config.backoff.delay_for(*poll);
                debug!(key = %key, poll = *poll, delay = ?delay, "key held by another worker, waiting");
                *poll += 1;
                tokio::time::sleep(delay).await;
                Ok(None)
            }
            _ => Err(IdempotencyError::ClaimConflict {
                key: key.to_string(),
                claimed_at: record.claimed_at,
            }),
        }
    }

    /// Best effort: a failed release leaves the claim to expire with its lease.
    async fn release_claim(&self, key: &IdempotencyKey, claim_id: &ClaimId) {
        match self.store.release(key, claim_id).await {
            Ok(true) => debug!(key = %key, claim_id = %claim_id, "claim released"),
            Ok(false) => warn!(key = %key, claim_id = %claim_id, "claim already gone on release"),
            Err(e) => warn!(
                key = %key,
                claim_id = %claim_id,
                error = %e,
                "release failed, claim will expire with its lease"
            ),
        }
    }
}

fn decode<T: DeserializeOwned>(
    key: &IdempotencyKey,
    record: ExecutionRecord,
) -> Result<T, IdempotencyError> {
    let raw = record.result.ok_or_else(|| {
        StoreError::Corrupt(format!("completed record {key} carries no result"))
    })?;
    serde_json::from_value(raw).map_err(|source| IdempotencyError::Codec {
        key: key.to_string(),
        source,
    })
}
