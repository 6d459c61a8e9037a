//! Config - TOML 設定の読み込みと検証
//!
//! ```toml
//! [executor]
//! lease_timeout_ms = 300000
//! action_timeout_ms = 30000
//! contention = { policy = "wait", max_polls = 40 }
//! backoff = { base_delay_ms = 25, multiplier = 2.0, max_delay_ms = 1000, jitter = true }
//!
//! [store]
//! backend = "sqlite"
//! path = "weft.db"
//! ```
//!
//! どのフィールドも省略可能です（空ファイルでも既定値で動く）。

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::backoff::Backoff;
use crate::impls::DEFAULT_CAS_RETRIES;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WeftConfig {
    pub executor: ExecutorConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    /// A Pending claim older than this is treated as orphaned.
    pub lease_timeout_ms: u64,
    pub action_timeout_ms: Option<u64>,
    pub contention: ContentionPolicy,
    pub backoff: Backoff,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            lease_timeout_ms: 300_000,
            action_timeout_ms: None,
            contention: ContentionPolicy::default(),
            backoff: Backoff::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn action_timeout(&self) -> Option<Duration> {
        self.action_timeout_ms.map(Duration::from_millis)
    }
}

/// What to do when another worker holds a valid claim on the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ContentionPolicy {
    /// Poll until the holder completes (or releases, or its lease expires),
    /// giving up with `ClaimConflict` after `max_polls` polls.
    Wait {
        #[serde(default = "default_max_polls")]
        max_polls: u32,
    },
    /// Return `ClaimConflict` immediately.
    Fail,
}

fn default_max_polls() -> u32 {
    40
}

impl Default for ContentionPolicy {
    fn default() -> Self {
        ContentionPolicy::Wait {
            max_polls: default_max_polls(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Records in task metadata of an in-process task store.
    Memory {
        #[serde(default = "default_cas_retries")]
        cas_retries: u32,
    },
    Sqlite { path: PathBuf },
}

fn default_cas_retries() -> u32 {
    DEFAULT_CAS_RETRIES
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory {
            cas_retries: default_cas_retries(),
        }
    }
}

impl WeftConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: WeftConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.executor.validate()?;
        self.store.validate()
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "executor.lease_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.action_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "executor.action_timeout_ms must be > 0 when set".to_string(),
            ));
        }
        if let ContentionPolicy::Wait { max_polls: 0 } = self.contention {
            return Err(ConfigError::Invalid(
                "executor.contention.max_polls must be > 0".to_string(),
            ));
        }
        let backoff = &self.backoff;
        if backoff.base_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "executor.backoff.base_delay_ms must be > 0".to_string(),
            ));
        }
        if !backoff.multiplier.is_finite() || backoff.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "executor.backoff.multiplier must be >= 1.0, got {}",
                backoff.multiplier
            )));
        }
        if backoff.max_delay_ms < backoff.base_delay_ms {
            return Err(ConfigError::Invalid(
                "executor.backoff.max_delay_ms must be >= base_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            StoreConfig::Memory { cas_retries: 0 } => Err(ConfigError::Invalid(
                "store.cas_retries must be > 0".to_string(),
            )),
            StoreConfig::Sqlite { path } if path.as_os_str().is_empty() => Err(
                ConfigError::Invalid("store.path must not be empty".to_string()),
            ),
            _ => Ok(()),
        }
    }
}
