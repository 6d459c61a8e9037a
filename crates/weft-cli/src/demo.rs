//! `weft demo`: concurrent workers on one email, then a batch with one failing item run twice.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;
use weft_core::app::{BatchItem, BatchMode, IdempotentExecutor};
use weft_core::domain::TaskId;
use weft_core::typed::EmailReceipt;

const BATCH_ITEMS: u32 = 5;
const FLAKY_ITEM: u32 = 3;

#[derive(Debug, Serialize)]
pub struct DemoSummary {
    pub workers: usize,
    pub email_sends: u32,
    pub email_cached_replies: usize,
    pub message_ids: Vec<String>,
    pub batch_runs: Vec<BatchRunSummary>,
    /// Invocations per batch item over both runs, item "1" first.
    pub batch_invocations: Vec<u32>,
}

#[derive(Debug, Serialize)]
pub struct BatchRunSummary {
    pub executed: usize,
    pub cached: usize,
    pub failed: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("mail relay rejected item {0}")]
struct FlakyError(u32);

pub async fn run(executor: Arc<IdempotentExecutor>, workers: usize) -> Result<DemoSummary> {
    let email_task = TaskId::new("demo-email");
    let batch_task = TaskId::new("demo-batch");
    // demo state from an earlier run against a file store would hide the race
    executor.clear_cache(&email_task).await?;
    executor.clear_cache(&batch_task).await?;

    let sends = Arc::new(AtomicU32::new(0));
    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let executor = Arc::clone(&executor);
        let sends = Arc::clone(&sends);
        let task = email_task.clone();
        handles.push(tokio::spawn(async move {
            executor
                .send_email_idempotent(&task, || async move {
                    sends.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, std::io::Error>(EmailReceipt::new(format!("msg-from-worker-{worker}")))
                })
                .await
        }));
    }

    let mut message_ids = Vec::with_capacity(workers);
    let mut cached_replies = 0;
    for handle in handles {
        let sent = handle.await.context("worker panicked")??;
        cached_replies += usize::from(sent.was_cached);
        message_ids.push(sent.message_id);
    }
    info!(
        sends = sends.load(Ordering::SeqCst),
        workers, "email race finished"
    );

    let invocations: Arc<Vec<AtomicU32>> =
        Arc::new((0..BATCH_ITEMS).map(|_| AtomicU32::new(0)).collect());
    let mut batch_runs = Vec::new();
    for run in 1..=2 {
        let report = executor
            .execute_batch(&batch_task, batch_items(&invocations), BatchMode::CollectAndReport)
            .await?;
        info!(run, executed = report.executed(), cached = report.cached(), "batch run finished");
        batch_runs.push(BatchRunSummary {
            executed: report.executed(),
            cached: report.cached(),
            failed: report.failures().map(|o| o.id.clone()).collect(),
        });
    }

    Ok(DemoSummary {
        workers,
        email_sends: sends.load(Ordering::SeqCst),
        email_cached_replies: cached_replies,
        message_ids,
        batch_runs,
        batch_invocations: invocations
            .iter()
            .map(|c| c.load(Ordering::SeqCst))
            .collect(),
    })
}

/// Items "1".."5"; the flaky item fails on its first invocation only.
fn batch_items(invocations: &Arc<Vec<AtomicU32>>) -> Vec<BatchItem<String, FlakyError>> {
    (1..=BATCH_ITEMS)
        .map(|n| {
            let invocations = Arc::clone(invocations);
            BatchItem::new(n.to_string(), move || async move {
                let previous = invocations[(n - 1) as usize].fetch_add(1, Ordering::SeqCst);
                if n == FLAKY_ITEM && previous == 0 {
                    return Err(FlakyError(n));
                }
                Ok(format!("item-{n}-done"))
            })
        })
        .collect()
}
