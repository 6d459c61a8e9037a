//! ExecutorBuilder - executor の構築とワイヤリング
//!
//! # Fail-fast 設計
//! - build() 時に設定を検証し、不正なら BuildError を返す
//! - 実行中に設定エラーが見つかることはない

use std::sync::Arc;

use super::config::{ConfigError, ExecutorConfig, StoreConfig, WeftConfig};
use super::executor::IdempotentExecutor;
use crate::domain::StoreError;
use crate::impls::{InMemoryTaskStore, MetadataRecordStore, SqliteRecordStore};
use crate::ports::{Clock, ExecutionRecordStore, SystemClock};

/// BuildError は executor 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not open the record store")]
    Store(#[from] StoreError),
}

/// # 使用例
/// ```ignore
/// let store = open_store(&config.store, clock.clone())?;
/// let executor = ExecutorBuilder::new(store)
///     .clock(clock)
///     .config(config.executor)
///     .build()?;
/// ```
pub struct ExecutorBuilder {
    store: Arc<dyn ExecutionRecordStore>,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
}

impl ExecutorBuilder {
    pub fn new(store: Arc<dyn ExecutionRecordStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            config: ExecutorConfig::default(),
        }
    }

    /// Clock used for lease expiry; should be the one the store was opened with.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<IdempotentExecutor, BuildError> {
        self.config.validate()?;
        Ok(IdempotentExecutor::from_parts(
            self.store,
            self.clock,
            self.config,
        ))
    }

    /// Validate `config`, open its store and build the executor on it.
    pub fn from_config(
        config: &WeftConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<IdempotentExecutor, BuildError> {
        config.validate()?;
        let store = open_store(&config.store, Arc::clone(&clock))?;
        ExecutorBuilder::new(store)
            .clock(clock)
            .config(config.executor.clone())
            .build()
    }
}

/// Construct the configured record store backend.
///
/// `memory` keeps records in the metadata of a fresh in-process task store,
/// so it is only shared by executors built on the returned handle.
pub fn open_store(
    config: &StoreConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn ExecutionRecordStore>, BuildError> {
    config.validate()?;
    let store: Arc<dyn ExecutionRecordStore> = match config {
        StoreConfig::Memory { cas_retries } => Arc::new(
            MetadataRecordStore::with_clock(InMemoryTaskStore::new(), clock)
                .cas_retries(*cas_retries),
        ),
        StoreConfig::Sqlite { path } => Arc::new(SqliteRecordStore::open_with_clock(path, clock)?),
    };
    Ok(store)
}
