//! Typed - 型付きの冪等アクション API
//!
//! action_type の typo を型で排除し、attempt の扱いを呼び出し側に明示させます。
//!
//! - `Action` trait: action_type と結果の型の対応
//! - `send_email_idempotent` / `record_payment_idempotent`: 定型のラッパー

pub mod action;
pub mod email;
pub mod payment;

pub use self::action::Action;
pub use self::email::{EmailReceipt, EmailSent, SendEmail};
pub use self::payment::{PaymentReceipt, PaymentRecorded, RecordPayment};
