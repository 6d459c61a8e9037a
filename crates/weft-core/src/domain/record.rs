//! Execution record: the per-key state kept by the record store.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::ClaimId;
use super::key::IdempotencyKey;

/// Record state.
///
/// State transitions:
/// ```text
/// (absent) -> Pending     claim
/// Pending  -> Completed   complete (owner only)
/// Pending  -> (absent)    release (owner, after a failed action) / reclaim (lease expired)
/// *        -> (absent)    clear_all
/// ```
///
/// Completed is terminal: the stored result is write-once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Pending,
    Completed,
}

impl RecordState {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordState::Pending => "pending",
            RecordState::Completed => "completed",
        }
    }

    /// Inverse of [`RecordState::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RecordState::Pending),
            "completed" => Some(RecordState::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub key: IdempotencyKey,
    pub state: RecordState,
    pub claim_id: ClaimId,
    /// Cached result, present once `state == Completed`.
    pub result: Option<serde_json::Value>,
    pub claimed_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn pending(key: IdempotencyKey, claim_id: ClaimId, claimed_at: DateTime<Utc>) -> Self {
        Self {
            key,
            state: RecordState::Pending,
            claim_id,
            result: None,
            claimed_at,
            completed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == RecordState::Completed
    }

    /// Pending and held by `claim_id`.
    pub fn is_held_by(&self, claim_id: &ClaimId) -> bool {
        self.state == RecordState::Pending && self.claim_id == *claim_id
    }

    /// A Pending claim older than the lease is orphaned and may be reclaimed.
    /// Completed records never expire.
    pub fn lease_expired(&self, now: DateTime<Utc>, lease_timeout: Duration) -> bool {
        if self.state != RecordState::Pending {
            return false;
        }
        match chrono::Duration::from_std(lease_timeout) {
            Ok(lease) => now - self.claimed_at >= lease,
            // absurdly long lease: never expires
            Err(_) => false,
        }
    }

    pub fn lease_expires_at(&self, lease_timeout: Duration) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(lease_timeout)
            .ok()
            .and_then(|lease| self.claimed_at.checked_add_signed(lease))
    }

    /// Pending -> Completed. Returns false (and changes nothing) unless the
    /// record is pending and held by `claim_id`.
    pub fn mark_completed(
        &mut self,
        claim_id: &ClaimId,
        result: serde_json::Value,
        completed_at: DateTime<Utc>,
    ) -> bool {
        if !self.is_held_by(claim_id) {
            return false;
        }
        self.state = RecordState::Completed;
        self.result = Some(result);
        self.completed_at = Some(completed_at);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::key::generate_idempotency_key;
    use chrono::TimeZone;
    use rstest::rstest;
    use ulid::Ulid;

    fn record_at(claimed_at: DateTime<Utc>) -> (ExecutionRecord, ClaimId) {
        let claim_id = ClaimId::from_ulid(Ulid::new());
        let key = generate_idempotency_key("task-1", "send_email", 0).unwrap();
        (ExecutionRecord::pending(key, claim_id, claimed_at), claim_id)
    }

    #[rstest]
    #[case::fresh(10, false)]
    #[case::just_below(299, false)]
    #[case::at_lease(300, true)]
    #[case::long_gone(3600, true)]
    fn pending_lease_expiry(#[case] elapsed_secs: i64, #[case] expired: bool) {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let (record, _) = record_at(t0);
        let now = t0 + chrono::Duration::seconds(elapsed_secs);
        assert_eq!(record.lease_expired(now, Duration::from_secs(300)), expired);
    }

    #[test]
    fn completed_records_never_expire() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let (mut record, claim_id) = record_at(t0);
        assert!(record.mark_completed(&claim_id, serde_json::json!({"ok": true}), t0));

        let much_later = t0 + chrono::Duration::days(30);
        assert!(!record.lease_expired(much_later, Duration::from_secs(1)));
    }

    #[test]
    fn completion_is_write_once() {
        let t0 = Utc::now();
        let (mut record, claim_id) = record_at(t0);
        assert!(record.mark_completed(&claim_id, serde_json::json!("first"), t0));
        assert!(!record.mark_completed(&claim_id, serde_json::json!("second"), t0));
        assert_eq!(record.result, Some(serde_json::json!("first")));
    }

    #[test]
    fn only_owner_can_complete() {
        let (mut record, _) = record_at(Utc::now());
        let stranger = ClaimId::from_ulid(Ulid::new());
        assert!(!record.mark_completed(&stranger, serde_json::json!(1), Utc::now()));
        assert_eq!(record.state, RecordState::Pending);
    }

    #[test]
    fn lease_expires_at_adds_timeout() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let (record, _) = record_at(t0);
        assert_eq!(
            record.lease_expires_at(Duration::from_secs(60)),
            Some(t0 + chrono::Duration::seconds(60))
        );
    }

    #[rstest]
    #[case(RecordState::Pending)]
    #[case(RecordState::Completed)]
    fn state_names_match_the_serialized_form(#[case] state: RecordState) {
        assert_eq!(serde_json::to_value(state).unwrap(), state.as_str());
        assert_eq!(RecordState::parse(state.as_str()), Some(state));
    }

    #[test]
    fn unknown_state_name_does_not_parse() {
        assert_eq!(RecordState::parse("running"), None);
        assert_eq!(RecordState::parse("Pending"), None);
    }
}
