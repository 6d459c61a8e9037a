//! send_email - メール送信の冪等ラッパー
//!
//! action_type は `send_email`、attempt は 0 固定。
//! 再送したい場合は `run_action_attempt::<SendEmail, ..>` で attempt を変えます。

use std::future::Future;

use serde::{Deserialize, Serialize};

use super::action::Action;
use crate::app::IdempotentExecutor;
use crate::domain::{ExecuteError, TaskId};

pub struct SendEmail;

impl Action for SendEmail {
    const ACTION_TYPE: &'static str = "send_email";
    type Output = EmailReceipt;
}

/// What the mail provider returned; this is what gets cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailReceipt {
    pub message_id: String,
}

impl EmailReceipt {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailSent {
    pub message_id: String,
    pub was_cached: bool,
}

impl IdempotentExecutor {
    pub async fn send_email_idempotent<E, F, Fut>(
        &self,
        task_id: &TaskId,
        send: F,
    ) -> Result<EmailSent, ExecuteError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<EmailReceipt, E>>,
    {
        let sent = self
            .run_action::<SendEmail, E, F, Fut>(task_id, send)
            .await?
            .map(|receipt| receipt.message_id);
        Ok(EmailSent {
            message_id: sent.value,
            was_cached: sent.was_cached,
        })
    }
}
