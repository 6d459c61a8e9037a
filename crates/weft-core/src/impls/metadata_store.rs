//! MetadataRecordStore - task metadata に実行記録を埋め込む実装
//!
//! 記録は task metadata の `"idempotency_keys"` に key → record の map として置きます。
//! 他の metadata には触りません。
//!
//! # アトミック性
//! すべての書き込みは「読む → 純粋関数で書き換える → version で CAS」の 1 サイクルで、
//! version が合わなければ少し待ってから読み直してやり直します。
//! 2 つのワーカーが同時に claim しても、CAS に勝てるのは片方だけです。
//!
//! version は task 単位なので、同じ task の別 key への書き込みでも CAS は外れます。
//! `cas_retries` に数えるのは自分の key の記録が動いた衝突だけです。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tracing::debug;

use crate::domain::{ClaimId, ExecutionRecord, IdempotencyKey, StoreError, TaskId};
use crate::ports::{
    CasOutcome, ClaimOutcome, Clock, ExecutionRecordStore, IdGenerator, SystemClock, TaskMetadata,
    TaskStore, UlidGenerator,
};

/// Metadata entry holding the records of a task.
pub const METADATA_FIELD: &str = "idempotency_keys";

pub const DEFAULT_CAS_RETRIES: u32 = 16;

type RecordMap = BTreeMap<String, ExecutionRecord>;

pub struct MetadataRecordStore<S> {
    tasks: S,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator<Arc<dyn Clock>>,
    cas_retries: u32,
}

impl<S: TaskStore> MetadataRecordStore<S> {
    pub fn new(tasks: S) -> Self {
        Self::with_clock(tasks, Arc::new(SystemClock))
    }

    pub fn with_clock(tasks: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            tasks,
            ids: UlidGenerator::new(Arc::clone(&clock)),
            clock,
            cas_retries: DEFAULT_CAS_RETRIES,
        }
    }

    /// How many conflicts on its own key a single operation tolerates.
    /// `clear_all` counts every conflict on the task.
    pub fn cas_retries(mut self, retries: u32) -> Self {
        self.cas_retries = retries.max(1);
        self
    }

    pub fn task_store(&self) -> &S {
        &self.tasks
    }

    async fn read(&self, task_id: &TaskId) -> Result<(TaskMetadata, RecordMap), StoreError> {
        let meta = self.tasks.get_metadata(task_id).await?;
        let records = decode_records(&meta)?;
        Ok((meta, records))
    }

    /// Read, apply `mutate`, and write back with a version check.
    ///
    /// `mutate` returns whether it changed the map; unchanged maps are not
    /// written. It may run several times, once per conflicting attempt.
    ///
    /// Every write to the task bumps the same version, so a mismatch only
    /// counts towards `cas_retries` when the part named by `scope` moved.
    /// Mismatches caused by writes to other keys are retried after a short
    /// jittered sleep without limit.
    async fn update<R, F>(
        &self,
        task_id: &TaskId,
        scope: Scope<'_>,
        mut mutate: F,
    ) -> Result<R, StoreError>
    where
        R: Send,
        F: FnMut(&mut RecordMap) -> Result<(bool, R), StoreError> + Send,
    {
        let mut conflicts = 0u32;
        let mut mismatches = 0u32;
        let mut seen_before_mismatch: Option<Option<ExecutionRecord>> = None;
        loop {
            let (meta, mut records) = self.read(task_id).await?;
            let seen = scope.entry(&records);
            if let Some(before) = seen_before_mismatch.take() {
                let moved = match scope {
                    Scope::Key(_) => before != seen,
                    Scope::Task => true,
                };
                if moved {
                    conflicts += 1;
                    if conflicts >= self.cas_retries {
                        return Err(StoreError::Contention {
                            task_id: task_id.to_string(),
                            attempts: conflicts,
                        });
                    }
                }
            }

            let (changed, out) = mutate(&mut records)?;
            if !changed {
                return Ok(out);
            }

            let mut values = meta.values;
            if records.is_empty() {
                values.remove(METADATA_FIELD);
            } else {
                values.insert(METADATA_FIELD.to_string(), serde_json::to_value(&records)?);
            }

            match self
                .tasks
                .update_metadata(task_id, meta.version, values)
                .await?
            {
                CasOutcome::Applied { .. } => return Ok(out),
                CasOutcome::VersionMismatch { current } => {
                    mismatches += 1;
                    debug!(
                        task_id = %task_id,
                        expected = meta.version,
                        current,
                        mismatches,
                        conflicts,
                        "metadata version moved, retrying"
                    );
                    seen_before_mismatch = Some(seen);
                    tokio::time::sleep(cas_backoff(mismatches)).await;
                }
            }
        }
    }
}

/// Which part of the task metadata an update depends on.
#[derive(Debug, Clone, Copy)]
enum Scope<'a> {
    /// One record, by rendered key.
    Key(&'a str),
    /// Every record of the task.
    Task,
}

impl Scope<'_> {
    fn entry(self, records: &RecordMap) -> Option<ExecutionRecord> {
        match self {
            Scope::Key(k) => records.get(k).cloned(),
            Scope::Task => None,
        }
    }
}

/// Up to 2^n ms (capped at 32ms), uniformly jittered.
fn cas_backoff(mismatches: u32) -> Duration {
    let cap_us = (1u64 << mismatches.min(5)) * 1000;
    Duration::from_micros(rand::thread_rng().gen_range(0..=cap_us))
}

fn decode_records(meta: &TaskMetadata) -> Result<RecordMap, StoreError> {
    match meta.values.get(METADATA_FIELD) {
        None | Some(Value::Null) => Ok(RecordMap::new()),
        Some(raw) => Ok(serde_json::from_value(raw.clone())?),
    }
}

#[async_trait]
impl<S: TaskStore> ExecutionRecordStore for MetadataRecordStore<S> {
    async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<ExecutionRecord>, StoreError> {
        let (_, mut records) = self.read(key.task_id()).await?;
        Ok(records.remove(&key.to_string()))
    }

    async fn claim(&self, key: &IdempotencyKey) -> Result<ClaimOutcome, StoreError> {
        let k = key.to_string();
        self.update(key.task_id(), Scope::Key(&k), |records| {
            if let Some(existing) = records.get(&k) {
                return Ok((false, ClaimOutcome::Held(existing.clone())));
            }
            let claim_id = self.ids.generate_claim_id();
            records.insert(
                k.clone(),
                ExecutionRecord::pending(key.clone(), claim_id, self.clock.now()),
            );
            Ok((true, ClaimOutcome::Claimed(claim_id)))
        })
        .await
    }

    async fn complete(
        &self,
        key: &IdempotencyKey,
        claim_id: &ClaimId,
        result: Value,
    ) -> Result<ExecutionRecord, StoreError> {
        let k = key.to_string();
        self.update(key.task_id(), Scope::Key(&k), |records| {
            let now = self.clock.now();
            match records.get_mut(&k) {
                Some(record) if record.is_held_by(claim_id) => {
                    record.mark_completed(claim_id, result.clone(), now);
                    Ok((true, record.clone()))
                }
                _ => Err(StoreError::NotClaimed {
                    key: k.clone(),
                    claim_id: *claim_id,
                }),
            }
        })
        .await
    }

    async fn release(&self, key: &IdempotencyKey, claim_id: &ClaimId) -> Result<bool, StoreError> {
        let k = key.to_string();
        self.update(key.task_id(), Scope::Key(&k), |records| {
            let ours = records.get(&k).is_some_and(|r| r.is_held_by(claim_id));
            if ours {
                records.remove(&k);
            }
            Ok((ours, ours))
        })
        .await
    }

    async fn reclaim(
        &self,
        key: &IdempotencyKey,
        lease_timeout: Duration,
    ) -> Result<bool, StoreError> {
        let k = key.to_string();
        self.update(key.task_id(), Scope::Key(&k), |records| {
            let now = self.clock.now();
            let expired = records
                .get(&k)
                .is_some_and(|r| r.lease_expired(now, lease_timeout));
            if expired {
                records.remove(&k);
            }
            Ok((expired, expired))
        })
        .await
    }

    async fn clear_all(&self, task_id: &TaskId) -> Result<usize, StoreError> {
        self.update(task_id, Scope::Task, |records| {
            let removed = records.len();
            records.clear();
            Ok((removed > 0, removed))
        })
        .await
    }

    async fn records(&self, task_id: &TaskId) -> Result<Vec<ExecutionRecord>, StoreError> {
        let (_, records) = self.read(task_id).await?;
        Ok(records.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RecordState, generate_idempotency_key};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};
    use serde_json::{Map, json};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn key(task: &str, action: &str) -> IdempotencyKey {
        generate_idempotency_key(task, action, 0).unwrap()
    }

    fn fixed_store() -> (
        MetadataRecordStore<Arc<InMemoryTaskStore>>,
        Arc<InMemoryTaskStore>,
        Arc<FixedClock>,
    ) {
        let tasks = Arc::new(InMemoryTaskStore::new());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let store = MetadataRecordStore::with_clock(Arc::clone(&tasks), clock.clone());
        (store, tasks, clock)
    }

    async fn claim_id(store: &impl ExecutionRecordStore, key: &IdempotencyKey) -> ClaimId {
        match store.claim(key).await.unwrap() {
            ClaimOutcome::Claimed(id) => id,
            ClaimOutcome::Held(r) => panic!("expected a fresh claim, found {r:?}"),
        }
    }

    #[tokio::test]
    async fn claim_then_complete() {
        let (store, _, _) = fixed_store();
        let k = key("task-1", "send_email");

        assert!(store.lookup(&k).await.unwrap().is_none());
        let id = claim_id(&store, &k).await;

        let pending = store.lookup(&k).await.unwrap().unwrap();
        assert_eq!(pending.state, RecordState::Pending);
        assert_eq!(pending.claim_id, id);

        let done = store
            .complete(&k, &id, json!({"message_id": "abc"}))
            .await
            .unwrap();
        assert_eq!(done.state, RecordState::Completed);
        assert_eq!(
            store.lookup(&k).await.unwrap().unwrap().result,
            Some(json!({"message_id": "abc"}))
        );
    }

    #[tokio::test]
    async fn second_claim_sees_the_first() {
        let (store, _, _) = fixed_store();
        let k = key("task-1", "send_email");
        let id = claim_id(&store, &k).await;

        match store.claim(&k).await.unwrap() {
            ClaimOutcome::Held(record) => assert_eq!(record.claim_id, id),
            other => panic!("expected Held, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn completed_result_is_write_once() {
        let (store, _, _) = fixed_store();
        let k = key("task-1", "send_email");
        let id = claim_id(&store, &k).await;
        store.complete(&k, &id, json!(1)).await.unwrap();

        let err = store.complete(&k, &id, json!(2)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotClaimed { .. }));
        assert_eq!(store.lookup(&k).await.unwrap().unwrap().result, Some(json!(1)));
    }

    #[tokio::test]
    async fn release_only_drops_our_own_claim() {
        let (store, _, _) = fixed_store();
        let k = key("task-1", "send_email");
        let id = claim_id(&store, &k).await;

        let stranger = ClaimId::from_ulid(ulid::Ulid::new());
        assert!(!store.release(&k, &stranger).await.unwrap());
        assert!(store.lookup(&k).await.unwrap().is_some());

        assert!(store.release(&k, &id).await.unwrap());
        assert!(store.lookup(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reclaim_waits_for_the_lease() {
        let (store, _, clock) = fixed_store();
        let k = key("task-1", "send_email");
        let lease = Duration::from_secs(300);
        let crashed = claim_id(&store, &k).await;

        clock.advance(Duration::from_secs(299));
        assert!(!store.reclaim(&k, lease).await.unwrap());

        clock.advance(Duration::from_secs(1));
        assert!(store.reclaim(&k, lease).await.unwrap());
        assert!(store.lookup(&k).await.unwrap().is_none());

        // the crashed worker comes back too late
        let err = store.complete(&k, &crashed, json!("late")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotClaimed { .. }));
    }

    #[tokio::test]
    async fn clear_all_keeps_foreign_metadata() {
        let (store, tasks, _) = fixed_store();
        let task = TaskId::new("task-1");
        let mut values = Map::new();
        values.insert("campaign".to_string(), json!("spring"));
        tasks.update_metadata(&task, 0, values).await.unwrap();

        for action in ["send_email", "record_payment"] {
            let k = key("task-1", action);
            let id = claim_id(&store, &k).await;
            store.complete(&k, &id, json!(action)).await.unwrap();
        }
        let other = key("task-2", "send_email");
        claim_id(&store, &other).await;

        assert_eq!(store.records(&task).await.unwrap().len(), 2);
        assert_eq!(store.clear_all(&task).await.unwrap(), 2);
        assert!(store.records(&task).await.unwrap().is_empty());
        assert_eq!(store.clear_all(&task).await.unwrap(), 0);

        let meta = tasks.get_metadata(&task).await.unwrap();
        assert_eq!(meta.values["campaign"], "spring");
        assert!(!meta.values.contains_key(METADATA_FIELD));
        assert!(store.lookup(&other).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn store_outage_propagates() {
        let (store, tasks, _) = fixed_store();
        tasks.set_available(false);
        let err = store.claim(&key("task-1", "send_email")).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    /// Lets another writer sneak in before the first `n` updates.
    struct Interfering {
        inner: InMemoryTaskStore,
        remaining: AtomicU32,
    }

    #[async_trait]
    impl TaskStore for Interfering {
        async fn get_metadata(&self, task_id: &TaskId) -> Result<TaskMetadata, StoreError> {
            self.inner.get_metadata(task_id).await
        }

        async fn update_metadata(
            &self,
            task_id: &TaskId,
            expected_version: u64,
            values: Map<String, Value>,
        ) -> Result<CasOutcome, StoreError> {
            if self.remaining.load(Ordering::SeqCst) > 0 {
                self.remaining.fetch_sub(1, Ordering::SeqCst);
                let current = self.inner.get_metadata(task_id).await?;
                self.inner
                    .update_metadata(task_id, current.version, current.values)
                    .await?;
            }
            self.inner
                .update_metadata(task_id, expected_version, values)
                .await
        }
    }

    #[tokio::test]
    async fn version_conflicts_are_retried() {
        let tasks = Interfering {
            inner: InMemoryTaskStore::new(),
            remaining: AtomicU32::new(2),
        };
        let store = MetadataRecordStore::new(tasks);
        let k = key("task-1", "send_email");

        assert!(matches!(
            store.claim(&k).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
        assert_eq!(store.task_store().inner.get_metadata(k.task_id()).await.unwrap().version, 3);
    }

    #[tokio::test]
    async fn writes_to_other_keys_do_not_use_up_retries() {
        let tasks = Interfering {
            inner: InMemoryTaskStore::new(),
            remaining: AtomicU32::new(20),
        };
        let store = MetadataRecordStore::new(tasks).cas_retries(1);
        let k = key("task-1", "send_email");

        let id = claim_id(&store, &k).await;
        let done = store.complete(&k, &id, json!("sent")).await.unwrap();
        assert_eq!(done.state, RecordState::Completed);
        assert_eq!(store.task_store().remaining.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn endless_conflicts_on_clear_all_give_up() {
        let tasks = Interfering {
            inner: InMemoryTaskStore::new(),
            remaining: AtomicU32::new(0),
        };
        let store = MetadataRecordStore::new(tasks).cas_retries(3);
        let k = key("task-1", "send_email");
        claim_id(&store, &k).await;

        store.task_store().remaining.store(u32::MAX, Ordering::SeqCst);
        let err = store.clear_all(k.task_id()).await.unwrap_err();
        assert!(matches!(err, StoreError::Contention { attempts: 3, .. }));
        assert!(store.lookup(&k).await.unwrap().is_some());
    }
}
