//! Batch - 複数 item を 1 タスクの中で冪等に実行する
//!
//! item ごとに `{task_id}:batch_{id}:0` の key を作り、executor に委ねます。
//! item は入力順に 1 つずつ実行されます。
//!
//! # BatchMode
//! - CollectAndReport（既定）: 失敗した item があっても残りを実行し、結果を全部返す
//! - FailFast: 最初の失敗で止め、残りの id を `skipped` に入れる
//!
//! どちらのモードでも、成功した item は完了として記録されます。
//! 同じ batch を再実行すると、成功済みの item はキャッシュが返り、失敗した item だけが再実行されます。

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::executor::IdempotentExecutor;
use crate::domain::{ExecuteError, IdempotencyError, IdempotencyKey, TaskId};

/// Prefix of the action type of every batch item.
pub const BATCH_ACTION_PREFIX: &str = "batch_";

type BoxedAction<T, E> =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<T, E>> + Send>> + Send>;

pub struct BatchItem<T, E> {
    id: String,
    action: BoxedAction<T, E>,
}

impl<T, E> BatchItem<T, E> {
    pub fn new<F, Fut>(id: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            id: id.into(),
            action: Box::new(move || Box::pin(action())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<T, E> fmt::Debug for BatchItem<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchItem").field("id", &self.id).finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatchMode {
    #[default]
    CollectAndReport,
    FailFast,
}

#[derive(Debug)]
pub struct BatchOutcome<T, E> {
    pub id: String,
    pub result: Result<T, ExecuteError<E>>,
    /// True only for a successful result served from an earlier run.
    pub was_cached: bool,
}

impl<T, E> BatchOutcome<T, E> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug)]
pub struct BatchReport<T, E> {
    /// One entry per item that ran, in input order.
    pub outcomes: Vec<BatchOutcome<T, E>>,
    /// Ids not run because an earlier item failed (FailFast only).
    pub skipped: Vec<String>,
}

impl<T, E> BatchReport<T, E> {
    pub fn all_succeeded(&self) -> bool {
        self.skipped.is_empty() && self.outcomes.iter().all(BatchOutcome::is_ok)
    }

    pub fn failures(&self) -> impl Iterator<Item = &BatchOutcome<T, E>> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }

    /// Items whose action actually ran and succeeded in this call.
    pub fn executed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.is_ok() && !o.was_cached)
            .count()
    }

    pub fn cached(&self) -> usize {
        self.outcomes.iter().filter(|o| o.was_cached).count()
    }

    pub fn get(&self, id: &str) -> Option<&BatchOutcome<T, E>> {
        self.outcomes.iter().find(|o| o.id == id)
    }
}

pub fn batch_item_key(task_id: &TaskId, item_id: &str) -> Result<IdempotencyKey, IdempotencyError> {
    IdempotencyKey::derive(task_id.clone(), format!("{BATCH_ACTION_PREFIX}{item_id}"), 0)
}

impl IdempotentExecutor {
    /// Run `items` under `task_id`, each at most once.
    ///
    /// All item keys are validated before anything runs: an item id that
    /// cannot form a key fails the whole call with `InvalidKey`. Items with
    /// equal ids share one key, so only the first of them runs.
    pub async fn execute_batch<T, E>(
        &self,
        task_id: &TaskId,
        items: Vec<BatchItem<T, E>>,
        mode: BatchMode,
    ) -> Result<BatchReport<T, E>, IdempotencyError>
    where
        T: Serialize + DeserializeOwned,
    {
        let keyed = items
            .into_iter()
            .map(|item| batch_item_key(task_id, &item.id).map(|key| (key, item)))
            .collect::<Result<Vec<_>, IdempotencyError>>()?;

        let mut report = BatchReport {
            outcomes: Vec::with_capacity(keyed.len()),
            skipped: Vec::new(),
        };
        let mut remaining = keyed.into_iter();
        for (key, item) in remaining.by_ref() {
            let BatchItem { id, action } = item;
            let outcome = match self.execute(&key, action).await {
                Ok(executed) => BatchOutcome {
                    id,
                    was_cached: executed.was_cached,
                    result: Ok(executed.value),
                },
                Err(e) => {
                    warn!(task_id = %task_id, key = %key, error = %ErrorSummary(&e), "batch item failed");
                    BatchOutcome {
                        id,
                        was_cached: false,
                        result: Err(e),
                    }
                }
            };
            let failed = !outcome.is_ok();
            report.outcomes.push(outcome);
            if failed && mode == BatchMode::FailFast {
                break;
            }
        }
        report.skipped = remaining.map(|(_, item)| item.id).collect();

        debug!(
            task_id = %task_id,
            executed = report.executed(),
            cached = report.cached(),
            failed = report.failures().count(),
            skipped = report.skipped.len(),
            "batch finished"
        );
        Ok(report)
    }
}

/// Display of an `ExecuteError<E>` without requiring `E: Display`.
struct ErrorSummary<'a, E>(&'a ExecuteError<E>);

impl<E> fmt::Display for ErrorSummary<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            ExecuteError::Action(_) => f.write_str("action failed"),
            ExecuteError::Idempotency(e) => fmt::Display::fmt(e, f),
        }
    }
}
