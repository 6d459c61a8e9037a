//! weft-core
//!
//! 副作用のある action（メール送信、決済の記録など）を、リトライや並行実行の下でも
//! key ごとに高々 1 回だけ実行するための building blocks です。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, key, record, outcome, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, ExecutionRecordStore, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryTaskStore, MetadataRecordStore, SqliteRecordStore）
//! - **app**: アプリケーションロジック（executor, batch, builder, config, backoff）
//! - **typed**: 型付き Action API（Action trait, send_email / record_payment ラッパー）
//!
//! # 使用例
//! ```ignore
//! let executor = ExecutorBuilder::from_config(&WeftConfig::load(path)?, Arc::new(SystemClock))?;
//! let key = generate_idempotency_key("task-123", "send_email", 0)?;
//! let sent = executor.execute(&key, || mailer.send(&message)).await?;
//! if sent.was_cached { /* already sent by an earlier run */ }
//! ```

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;

pub use crate::app::{
    BatchItem, BatchMode, BatchReport, ContentionPolicy, ExecutorBuilder, IdempotentExecutor,
    WeftConfig,
};
pub use crate::domain::{
    ExecuteError, Executed, IdempotencyError, IdempotencyKey, TaskId, generate_idempotency_key,
};
