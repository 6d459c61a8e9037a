//! Idempotency keys.
//!
//! A key names one logical instance of a side-effecting action:
//! `{task_id}:{action_type}:{attempt}`. The same key means "the same send";
//! a different `attempt` means a deliberately new instance, not a retry.
//!
//! `:` is reserved. Components that are empty or contain it are rejected, so
//! two distinct `(task_id, action_type)` pairs can never render the same key.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::IdempotencyError;
use super::task::{ActionType, TaskId};

pub const KEY_DELIMITER: char = ':';

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    task_id: TaskId,
    action_type: ActionType,
    attempt: u32,
}

impl IdempotencyKey {
    pub fn derive(
        task_id: impl Into<TaskId>,
        action_type: impl Into<ActionType>,
        attempt: u32,
    ) -> Result<Self, IdempotencyError> {
        let task_id = task_id.into();
        let action_type = action_type.into();
        check_component("task_id", task_id.as_str())?;
        check_component("action_type", action_type.as_str())?;
        Ok(Self {
            task_id,
            action_type,
            attempt,
        })
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn action_type(&self) -> &ActionType {
        &self.action_type
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Key for `attempt` of `action_type` within `task_id`. Single-shot actions
/// use attempt 0.
pub fn generate_idempotency_key(
    task_id: &str,
    action_type: &str,
    attempt: u32,
) -> Result<IdempotencyKey, IdempotencyError> {
    IdempotencyKey::derive(task_id, action_type, attempt)
}

fn check_component(field: &'static str, value: &str) -> Result<(), IdempotencyError> {
    let reason = if value.is_empty() {
        "must not be empty"
    } else if value.contains(KEY_DELIMITER) {
        "must not contain ':'"
    } else {
        return Ok(());
    };
    Err(IdempotencyError::InvalidKey {
        field,
        value: value.to_string(),
        reason,
    })
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{KEY_DELIMITER}{}{KEY_DELIMITER}{}",
            self.task_id, self.action_type, self.attempt
        )
    }
}

impl FromStr for IdempotencyKey {
    type Err = IdempotencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || IdempotencyError::InvalidKey {
            field: "key",
            value: s.to_string(),
            reason: "expected `task_id:action_type:attempt`",
        };
        let mut parts = s.split(KEY_DELIMITER);
        let (Some(task_id), Some(action_type), Some(attempt), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        let attempt = attempt.parse::<u32>().map_err(|_| malformed())?;
        Self::derive(task_id, action_type, attempt)
    }
}

impl Serialize for IdempotencyKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IdempotencyKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
