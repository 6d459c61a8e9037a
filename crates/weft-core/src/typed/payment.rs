//! record_payment - 決済 webhook の取り込みの冪等ラッパー
//!
//! 決済プロバイダは同じイベントを何度でも再送してくるので、
//! task_id にイベント id を使えば同じイベントの二重計上を防げます。

use std::future::Future;

use serde::{Deserialize, Serialize};

use super::action::Action;
use crate::app::IdempotentExecutor;
use crate::domain::{ExecuteError, TaskId};

pub struct RecordPayment;

impl Action for RecordPayment {
    const ACTION_TYPE: &'static str = "record_payment";
    type Output = PaymentReceipt;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub payment_id: String,
}

impl PaymentReceipt {
    pub fn new(payment_id: impl Into<String>) -> Self {
        Self {
            payment_id: payment_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentRecorded {
    pub payment_id: String,
    pub was_cached: bool,
}

impl IdempotentExecutor {
    pub async fn record_payment_idempotent<E, F, Fut>(
        &self,
        task_id: &TaskId,
        record: F,
    ) -> Result<PaymentRecorded, ExecuteError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PaymentReceipt, E>>,
    {
        let recorded = self
            .run_action::<RecordPayment, E, F, Fut>(task_id, record)
            .await?
            .map(|receipt| receipt.payment_id);
        Ok(PaymentRecorded {
            payment_id: recorded.value,
            was_cached: recorded.was_cached,
        })
    }
}
