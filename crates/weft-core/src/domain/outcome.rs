//! What a caller gets back from the executor.

use serde::{Deserialize, Serialize};

/// Value returned by an idempotent execution.
///
/// `was_cached` distinguishes "ran now" from "already done, skipped".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Executed<T> {
    pub value: T,
    pub was_cached: bool,
}

impl<T> Executed<T> {
    pub fn fresh(value: T) -> Self {
        Self {
            value,
            was_cached: false,
        }
    }

    pub fn cached(value: T) -> Self {
        Self {
            value,
            was_cached: true,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Executed<U> {
        Executed {
            value: f(self.value),
            was_cached: self.was_cached,
        }
    }
}
