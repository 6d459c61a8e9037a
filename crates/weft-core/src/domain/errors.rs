//! Errors - エラー型と分類
//!
//! - `StoreError`: 永続化層（TaskStore / ExecutionRecordStore）の失敗
//! - `IdempotencyError`: この層が呼び出し側に返す失敗（claim 競合など）
//! - `ExecuteError<E>`: ラップした action の失敗 `E` をそのまま運ぶ外側の型
//!
//! action の失敗は決してキャッシュされないので、`ExecuteError::Action` は
//! 呼び出し側のリトライ方針にそのまま委ねられます。

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::ids::ClaimId;

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: インフラエラー（ストアの障害）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// Failure of the backing store. This layer never retries these internally,
/// except for compare-and-swap version conflicts.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("record of task {task_id} changed under us {attempts} times")]
    Contention { task_id: String, attempts: u32 },

    #[error("no pending claim {claim_id} on {key}")]
    NotClaimed { key: String, claim_id: ClaimId },

    #[error("stored record is corrupt: {0}")]
    Corrupt(String),

    #[error("stored metadata could not be decoded")]
    Decode(#[from] serde_json::Error),

    #[error("sqlite operation failed")]
    Sqlite(#[from] rusqlite::Error),

    #[error("blocking store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Errors surfaced by the idempotency layer itself.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("task store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    #[error("writes to task {task_id} kept conflicting, gave up after {attempts} attempts")]
    Contended { task_id: String, attempts: u32 },

    #[error("{key} is claimed by another worker since {claimed_at}")]
    ClaimConflict {
        key: String,
        claimed_at: DateTime<Utc>,
    },

    #[error("claim {claim_id} on {key} was reclaimed before the result could be recorded")]
    ClaimLost { key: String, claim_id: ClaimId },

    #[error("invalid {field} {value:?}: {reason}")]
    InvalidKey {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("result for {key} could not be encoded or decoded")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("action for {key} did not finish within {timeout:?}")]
    ActionTimedOut { key: String, timeout: Duration },
}

impl From<StoreError> for IdempotencyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Contention { task_id, attempts } => {
                IdempotencyError::Contended { task_id, attempts }
            }
            other => IdempotencyError::StoreUnavailable(other),
        }
    }
}

impl IdempotencyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IdempotencyError::StoreUnavailable(_) => ErrorKind::Infrastructure,
            IdempotencyError::ClaimConflict { .. }
            | IdempotencyError::Contended { .. }
            | IdempotencyError::ClaimLost { .. }
            | IdempotencyError::ActionTimedOut { .. } => ErrorKind::Transient,
            IdempotencyError::InvalidKey { .. } | IdempotencyError::Codec { .. } => {
                ErrorKind::Permanent
            }
        }
    }

    /// Whether the caller may retry the whole call later.
    pub fn is_retryable(&self) -> bool {
        self.kind() != ErrorKind::Permanent
    }
}

/// Result of `execute`: either the wrapped action's own error, unchanged, or
/// an error of this layer.
#[derive(Debug, Error)]
pub enum ExecuteError<E> {
    #[error("action failed: {0}")]
    Action(#[source] E),

    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
}

impl<E> ExecuteError<E> {
    /// The action's error, if that is what failed.
    pub fn action_error(&self) -> Option<&E> {
        match self {
            ExecuteError::Action(e) => Some(e),
            ExecuteError::Idempotency(_) => None,
        }
    }

    pub fn into_action_error(self) -> Option<E> {
        match self {
            ExecuteError::Action(e) => Some(e),
            ExecuteError::Idempotency(_) => None,
        }
    }

    /// Another worker held the key, or kept the task's records busy.
    pub fn is_claim_conflict(&self) -> bool {
        matches!(
            self,
            ExecuteError::Idempotency(
                IdempotencyError::ClaimConflict { .. } | IdempotencyError::Contended { .. }
            )
        )
    }
}
