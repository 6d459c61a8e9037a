//! Domain model (keys, records, errors, ids).
//!
//! ストアや実行器に依存しない純粋な型だけを置きます。

pub mod errors;
pub mod ids;
pub mod key;
pub mod outcome;
pub mod record;
pub mod task;

pub use self::errors::{ErrorKind, ExecuteError, IdempotencyError, StoreError};
pub use self::ids::{ClaimId, Id, IdMarker};
pub use self::key::{IdempotencyKey, generate_idempotency_key};
pub use self::outcome::Executed;
pub use self::record::{ExecutionRecord, RecordState};
pub use self::task::{ActionType, TaskId};
