//! App - アプリケーション層
//!
//! ports を組み合わせて冪等実行のロジックを実装します。
//!
//! # 主要コンポーネント
//! - **IdempotentExecutor**: lookup → claim → action → complete
//! - **Batch**: item ごとの key 導出と実行（CollectAndReport / FailFast）
//! - **ExecutorBuilder**: 設定の検証とストアのワイヤリング
//! - **Config / Backoff**: TOML 設定と競合時のポーリング間隔

pub mod backoff;
pub mod batch;
pub mod builder;
pub mod config;
pub mod executor;

pub use self::backoff::Backoff;
pub use self::batch::{BatchItem, BatchMode, BatchOutcome, BatchReport, batch_item_key};
pub use self::builder::{BuildError, ExecutorBuilder, open_store};
pub use self::config::{ConfigError, ContentionPolicy, ExecutorConfig, StoreConfig, WeftConfig};
pub use self::executor::IdempotentExecutor;
