//! Action trait - 型付きの冪等アクション
//!
//! # 学習ポイント
//! - Associated Constants (`const ACTION_TYPE`)
//! - Associated Types（キャッシュされる結果の型）
//!
//! action_type を定数にしておくことで、呼び出し側が key の文字列を組み立てる必要がなくなり、
//! 「同じ attempt ⇒ 同じ送信」という約束がコード上で守られます。

use std::future::Future;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::app::IdempotentExecutor;
use crate::domain::{ExecuteError, Executed, IdempotencyKey, TaskId};

/// Action は action_type と結果の型を対応付ける
///
/// # 使用例
/// ```ignore
/// struct SendInvoice;
///
/// impl Action for SendInvoice {
///     const ACTION_TYPE: &'static str = "send_invoice";
///     type Output = InvoiceReceipt;
/// }
///
/// let sent = executor.run_action::<SendInvoice, _, _, _>(&task_id, || send()).await?;
/// ```
pub trait Action: Send + Sync + 'static {
    /// key の 2 番目の要素。`:` を含んではいけない。
    const ACTION_TYPE: &'static str;

    /// 保存・再利用される結果（JSON で保存）
    type Output: Serialize + DeserializeOwned + Send;
}

impl IdempotentExecutor {
    /// Run action `A` for `task_id` with attempt 0.
    pub async fn run_action<A, E, F, Fut>(
        &self,
        task_id: &TaskId,
        action: F,
    ) -> Result<Executed<A::Output>, ExecuteError<E>>
    where
        A: Action,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<A::Output, E>>,
    {
        self.run_action_attempt::<A, E, F, Fut>(task_id, 0, action)
            .await
    }

    /// Run action `A` as instance `attempt`. A new attempt number is a
    /// deliberately new send, not a retry of an earlier one.
    pub async fn run_action_attempt<A, E, F, Fut>(
        &self,
        task_id: &TaskId,
        attempt: u32,
        action: F,
    ) -> Result<Executed<A::Output>, ExecuteError<E>>
    where
        A: Action,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<A::Output, E>>,
    {
        let key = IdempotencyKey::derive(task_id.clone(), A::ACTION_TYPE, attempt)?;
        self.execute(&key, action).await
    }
}
