//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: 開発・テスト用の TaskStore（CAS 付き）
//! - **MetadataRecordStore**: 任意の TaskStore の metadata に実行記録を置く
//! - **SqliteRecordStore**: SQLite の専用テーブルに実行記録を置く

pub mod inmem_task_store;
pub mod metadata_store;
pub mod sqlite_store;

pub use self::inmem_task_store::InMemoryTaskStore;
pub use self::metadata_store::{DEFAULT_CAS_RETRIES, METADATA_FIELD, MetadataRecordStore};
pub use self::sqlite_store::SqliteRecordStore;
