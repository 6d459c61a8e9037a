//! Backoff - 他ワーカーの claim 待ちのポーリング間隔
//!
//! delay = base_delay * multiplier^poll（max_delay で頭打ち）
//!
//! 例: base=25ms, multiplier=2.0, max=1000ms
//! - poll 0: 25ms
//! - poll 1: 50ms
//! - poll 2: 100ms
//! - poll 6 以降: 1000ms
//!
//! jitter 有効時は [delay/2, delay] から一様に選びます（待機側が揃って起きないように）。

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Backoff {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay_ms: 25,
            multiplier: 2.0,
            max_delay_ms: 1000,
            jitter: true,
        }
    }
}

impl Backoff {
    /// Delay before poll number `poll` (0-indexed), without jitter.
    pub fn next_delay(&self, poll: u32) -> Duration {
        let exponent = i32::try_from(poll).unwrap_or(i32::MAX);
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped as u64)
    }

    /// `next_delay` with jitter applied if enabled.
    pub fn delay_for(&self, poll: u32) -> Duration {
        let delay = self.next_delay(poll);
        if !self.jitter {
            return delay;
        }
        let ms = delay.as_millis() as u64;
        if ms < 2 {
            return delay;
        }
        Duration::from_millis(rand::thread_rng().gen_range(ms / 2..=ms))
    }

    /// Upper bound of the total time spent sleeping over `polls` polls.
    pub fn total_wait(&self, polls: u32) -> Duration {
        (0..polls).map(|p| self.next_delay(p)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn no_jitter() -> Backoff {
        Backoff {
            jitter: false,
            ..Backoff::default()
        }
    }

    #[rstest]
    #[case(0, 25)]
    #[case(1, 50)]
    #[case(2, 100)]
    #[case(5, 800)]
    #[case(6, 1000)]
    #[case(40, 1000)]
    #[case(u32::MAX, 1000)]
    fn exponential_and_capped(#[case] poll: u32, #[case] expected_ms: u64) {
        assert_eq!(no_jitter().next_delay(poll), Duration::from_millis(expected_ms));
    }

    #[test]
    fn jitter_stays_within_half_to_full() {
        let backoff = Backoff::default();
        for poll in 0..10 {
            let full = backoff.next_delay(poll);
            let d = backoff.delay_for(poll);
            assert!(d <= full, "{d:?} > {full:?}");
            let floor = Duration::from_millis(full.as_millis() as u64 / 2);
            assert!(d >= floor, "{d:?} < half of {full:?}");
        }
    }

    #[test]
    fn without_jitter_delay_is_exact() {
        let backoff = no_jitter();
        assert_eq!(backoff.delay_for(3), backoff.next_delay(3));
    }

    #[test]
    fn total_wait_sums_the_schedule() {
        // 25 + 50 + 100
        assert_eq!(no_jitter().total_wait(3), Duration::from_millis(175));
    }
}
