//! SqliteRecordStore - 専用テーブルに実行記録を置く実装
//!
//! # アトミック性
//! - `key` が主キー。claim は `INSERT ... ON CONFLICT(key) DO NOTHING` で、
//!   変更行数が 1 なら claim 成功、0 なら既存の記録がある
//! - complete / release / reclaim は条件付き UPDATE / DELETE（1 文で判定と書き込み）
//!
//! 同じファイルを開いた別プロセスとも主キー制約で直列化されます。
//!
//! # 実装詳細
//! - rusqlite は同期 API なので、Arc<Mutex<Connection>> を spawn_blocking の中で使う

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tracing::{debug, info};

use crate::domain::{
    ClaimId, ExecutionRecord, IdempotencyKey, RecordState, StoreError, TaskId,
};
use crate::ports::{
    ClaimOutcome, Clock, ExecutionRecordStore, IdGenerator, SystemClock, UlidGenerator,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS idempotency_keys (
    key             TEXT PRIMARY KEY NOT NULL,
    task_id         TEXT NOT NULL,
    state           TEXT NOT NULL CHECK (state IN ('pending', 'completed')),
    claim_id        TEXT NOT NULL,
    result          TEXT,
    claimed_at_ms   INTEGER NOT NULL,
    completed_at_ms INTEGER
);
CREATE INDEX IF NOT EXISTS idx_idempotency_keys_task ON idempotency_keys (task_id);
";

const COLUMNS: &str = "key, state, claim_id, result, claimed_at_ms, completed_at_ms";

/// A claim that loses the insert race and then finds the row gone again
/// (released in between) tries again this many times.
const CLAIM_RACE_RETRIES: u32 = 3;

pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator<Arc<dyn Clock>>,
}

impl SqliteRecordStore {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        path: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        info!(path = %path.display(), journal_mode = %mode, "sqlite record store opened");
        Self::init(conn, clock)
    }

    /// Private in-memory database (one per store instance).
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::in_memory_with_clock(Arc::new(SystemClock))
    }

    pub fn in_memory_with_clock(clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, clock)
    }

    fn init(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ids: UlidGenerator::new(Arc::clone(&clock)),
            clock,
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| {
                StoreError::Unavailable("sqlite connection mutex poisoned".to_string())
            })?;
            f(&guard)
        })
        .await?
    }
}

fn select_one(conn: &Connection, key: &str) -> Result<Option<ExecutionRecord>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM idempotency_keys WHERE key = ?1"),
            params![key],
            RawRecord::from_row,
        )
        .optional()?;
    raw.map(RawRecord::into_record).transpose()
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {ms} out of range")))
}

/// Row as stored; decoded into the domain type separately so that a corrupt
/// row surfaces as `StoreError::Corrupt` instead of a sqlite type error.
struct RawRecord {
    key: String,
    state: String,
    claim_id: String,
    result: Option<String>,
    claimed_at_ms: i64,
    completed_at_ms: Option<i64>,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            state: row.get(1)?,
            claim_id: row.get(2)?,
            result: row.get(3)?,
            claimed_at_ms: row.get(4)?,
            completed_at_ms: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<ExecutionRecord, StoreError> {
        let key: IdempotencyKey = self
            .key
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("key {:?}: {e}", self.key)))?;
        let state = RecordState::parse(&self.state)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown state {:?}", self.state)))?;
        let claim_id: ClaimId = self
            .claim_id
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("{e}")))?;
        let result = self
            .result
            .map(|raw| serde_json::from_str::<Value>(&raw))
            .transpose()?;
        Ok(ExecutionRecord {
            key,
            state,
            claim_id,
            result,
            claimed_at: from_millis(self.claimed_at_ms)?,
            completed_at: self.completed_at_ms.map(from_millis).transpose()?,
        })
    }
}

#[async_trait]
impl ExecutionRecordStore for SqliteRecordStore {
    async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<ExecutionRecord>, StoreError> {
        let k = key.to_string();
        self.with_conn(move |conn| select_one(conn, &k)).await
    }

    async fn claim(&self, key: &IdempotencyKey) -> Result<ClaimOutcome, StoreError> {
        let k = key.to_string();
        let task_id = key.task_id().to_string();
        let claim_id = self.ids.generate_claim_id();
        let claimed_at = to_millis(self.clock.now());

        self.with_conn(move |conn| {
            for _ in 0..CLAIM_RACE_RETRIES {
                let inserted = conn.execute(
                    "INSERT INTO idempotency_keys
                         (key, task_id, state, claim_id, result, claimed_at_ms, completed_at_ms)
                     VALUES (?1, ?2, ?3, ?4, NULL, ?5, NULL)
                     ON CONFLICT(key) DO NOTHING",
                    params![
                        k,
                        task_id,
                        RecordState::Pending.as_str(),
                        claim_id.to_string(),
                        claimed_at
                    ],
                )?;
                if inserted == 1 {
                    return Ok(ClaimOutcome::Claimed(claim_id));
                }
                if let Some(existing) = select_one(conn, &k)? {
                    return Ok(ClaimOutcome::Held(existing));
                }
                debug!(key = %k, "conflicting row vanished before it could be read, retrying insert");
            }
            Err(StoreError::Contention {
                task_id,
                attempts: CLAIM_RACE_RETRIES,
            })
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
        let claim_id = *claim_id;
        let completed_at = to_millis(self.clock.now());
        let result = serde_json::to_string(&result)?;

        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE idempotency_keys
                    SET state = ?1, result = ?2, completed_at_ms = ?3
                  WHERE key = ?4 AND state = ?5 AND claim_id = ?6",
                params![
                    RecordState::Completed.as_str(),
                    result,
                    completed_at,
                    k,
                    RecordState::Pending.as_str(),
                    claim_id.to_string()
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::NotClaimed { key: k, claim_id });
            }
            select_one(conn, &k)?.ok_or(StoreError::NotClaimed { key: k, claim_id })
        })
        .await
    }

    async fn release(&self, key: &IdempotencyKey, claim_id: &ClaimId) -> Result<bool, StoreError> {
        let k = key.to_string();
        let claim_id = claim_id.to_string();
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM idempotency_keys
                  WHERE key = ?1 AND state = ?2 AND claim_id = ?3",
                params![k, RecordState::Pending.as_str(), claim_id],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn reclaim(
        &self,
        key: &IdempotencyKey,
        lease_timeout: Duration,
    ) -> Result<bool, StoreError> {
        let k = key.to_string();
        let lease_ms = i64::try_from(lease_timeout.as_millis()).unwrap_or(i64::MAX);
        let cutoff = to_millis(self.clock.now()).saturating_sub(lease_ms);
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM idempotency_keys
                  WHERE key = ?1 AND state = ?2 AND claimed_at_ms <= ?3",
                params![k, RecordState::Pending.as_str(), cutoff],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn clear_all(&self, task_id: &TaskId) -> Result<usize, StoreError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "DELETE FROM idempotency_keys WHERE task_id = ?1",
                params![task_id],
            )?)
        })
        .await
    }

    async fn records(&self, task_id: &TaskId) -> Result<Vec<ExecutionRecord>, StoreError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM idempotency_keys WHERE task_id = ?1 ORDER BY key"
            ))?;
            let rows = stmt.query_map(params![task_id], RawRecord::from_row)?;
            let mut records = Vec::new();
            for raw in rows {
                records.push(raw?.into_record()?);
            }
            Ok(records)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::generate_idempotency_key;
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use serde_json::json;

    fn key(task: &str, action: &str) -> IdempotencyKey {
        generate_idempotency_key(task, action, 0).unwrap()
    }

    fn fixed_store() -> (SqliteRecordStore, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let store = SqliteRecordStore::in_memory_with_clock(clock.clone()).unwrap();
        (store, clock)
    }

    async fn claim_id(store: &SqliteRecordStore, key: &IdempotencyKey) -> ClaimId {
        match store.claim(key).await.unwrap() {
            ClaimOutcome::Claimed(id) => id,
            ClaimOutcome::Held(r) => panic!("expected a fresh claim, found {r:?}"),
        }
    }

    /// Unique file under the temp dir, removed on drop.
    struct TempDb(std::path::PathBuf);

    impl TempDb {
        fn new() -> Self {
            Self(std::env::temp_dir().join(format!("weft-{}.db", ulid::Ulid::new())))
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            for suffix in ["", "-wal", "-shm"] {
                let mut path = self.0.clone().into_os_string();
                path.push(suffix);
                let _ = std::fs::remove_file(path);
            }
        }
    }

    #[tokio::test]
    async fn claim_complete_lookup() {
        let (store, clock) = fixed_store();
        let k = key("task-123", "send_email");
        let id = claim_id(&store, &k).await;

        let pending = store.lookup(&k).await.unwrap().unwrap();
        assert_eq!(pending.state, RecordState::Pending);
        assert_eq!(pending.claimed_at, clock.now());

        clock.advance(Duration::from_millis(1500));
        let done = store
            .complete(&k, &id, json!({"message_id": "abc"}))
            .await
            .unwrap();
        assert_eq!(done.state, RecordState::Completed);
        assert_eq!(done.result, Some(json!({"message_id": "abc"})));
        assert_eq!(done.completed_at, Some(clock.now()));
        assert_eq!(done.key, k);
    }

    #[tokio::test]
    async fn second_claim_is_held() {
        let (store, _) = fixed_store();
        let k = key("task-1", "send_email");
        let id = claim_id(&store, &k).await;
        store.complete(&k, &id, json!(7)).await.unwrap();

        match store.claim(&k).await.unwrap() {
            ClaimOutcome::Held(record) => {
                assert!(record.is_completed());
                assert_eq!(record.result, Some(json!(7)));
            }
            other => panic!("expected Held, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn complete_requires_the_claim() {
        let (store, _) = fixed_store();
        let k = key("task-1", "send_email");
        claim_id(&store, &k).await;

        let stranger = ClaimId::from_ulid(ulid::Ulid::new());
        let err = store.complete(&k, &stranger, json!(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotClaimed { .. }));

        let missing = key("task-1", "record_payment");
        let err = store.complete(&missing, &stranger, json!(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotClaimed { .. }));
    }

    #[tokio::test]
    async fn release_and_reclaim() {
        let (store, clock) = fixed_store();
        let lease = Duration::from_secs(60);

        let failed = key("task-1", "send_email");
        let id = claim_id(&store, &failed).await;
        assert!(store.release(&failed, &id).await.unwrap());
        assert!(store.lookup(&failed).await.unwrap().is_none());

        let crashed = key("task-1", "record_payment");
        claim_id(&store, &crashed).await;
        assert!(!store.reclaim(&crashed, lease).await.unwrap());
        clock.advance(lease);
        assert!(store.reclaim(&crashed, lease).await.unwrap());
        assert!(store.lookup(&crashed).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completed_rows_are_not_reclaimed() {
        let (store, clock) = fixed_store();
        let k = key("task-1", "send_email");
        let id = claim_id(&store, &k).await;
        store.complete(&k, &id, json!(null)).await.unwrap();

        clock.advance(Duration::from_secs(86_400));
        assert!(!store.reclaim(&k, Duration::from_secs(1)).await.unwrap());
        assert!(store.lookup(&k).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn clear_all_is_per_task() {
        let (store, _) = fixed_store();
        for action in ["batch_1", "batch_2", "batch_3"] {
            claim_id(&store, &key("task-1", action)).await;
        }
        claim_id(&store, &key("task-2", "batch_1")).await;

        let listed = store.records(&TaskId::new("task-1")).await.unwrap();
        let keys: Vec<String> = listed.iter().map(|r| r.key.to_string()).collect();
        assert_eq!(keys, ["task-1:batch_1:0", "task-1:batch_2:0", "task-1:batch_3:0"]);

        assert_eq!(store.clear_all(&TaskId::new("task-1")).await.unwrap(), 3);
        assert!(store.records(&TaskId::new("task-1")).await.unwrap().is_empty());
        assert_eq!(store.records(&TaskId::new("task-2")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn two_connections_share_one_claim() {
        let db = TempDb::new();
        let a = SqliteRecordStore::open(&db.0).unwrap();
        let b = SqliteRecordStore::open(&db.0).unwrap();
        let k = key("task-1", "send_email");

        let id = claim_id(&a, &k).await;
        match b.claim(&k).await.unwrap() {
            ClaimOutcome::Held(record) => assert_eq!(record.claim_id, id),
            other => panic!("expected Held, got {other:?}"),
        }

        a.complete(&k, &id, json!("sent")).await.unwrap();
        let seen = b.lookup(&k).await.unwrap().unwrap();
        assert_eq!(seen.result, Some(json!("sent")));
    }

    #[tokio::test]
    async fn corrupt_rows_are_reported() {
        let (store, _) = fixed_store();
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO idempotency_keys VALUES ('task-1:x:0', 'task-1', 'pending', 'nope', NULL, 0, NULL)",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let err = store.lookup(&key("task-1", "x")).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[tokio::test]
    async fn unknown_state_is_corrupt() {
        let (store, _) = fixed_store();
        store
            .with_conn(|conn| {
                conn.execute_batch(
                    "PRAGMA ignore_check_constraints = ON;
                     INSERT INTO idempotency_keys VALUES
                         ('task-1:x:0', 'task-1', 'running', 'claim-01ARZ3NDEKTSV4RRFFQ69G5FAV', NULL, 0, NULL);",
                )?;
                Ok(())
            })
            .await
            .unwrap();

        match store.lookup(&key("task-1", "x")).await.unwrap_err() {
            StoreError::Corrupt(msg) => assert!(msg.contains("running"), "{msg}"),
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }
}
