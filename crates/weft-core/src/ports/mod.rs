//! Ports - 抽象化レイヤー
//!
//! 外部システム（タスクストア、データベース、時計）へのインターフェースです。
//! 実装は `impls` に置きます。

pub mod clock;
pub mod id_generator;
pub mod record_store;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::record_store::{ClaimOutcome, ExecutionRecordStore};
pub use self::task_store::{CasOutcome, TaskMetadata, TaskStore};
