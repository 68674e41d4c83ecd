//! Reconciliation loop primitives.
//!
//! A convergence loop re-derives the work to do from scratch on every pass,
//! so a resource that keeps failing would be retried on every pass. This
//! library holds the small amount of memory the loop needs to space those
//! retries out:
//!
//! - **Failure tracking**: consecutive failures per resource key, with the
//!   time of the most recent one.
//! - **Backoff**: the wait required before the next attempt grows as
//!   `2^failures * increment`, capped at a ceiling.
//!
//! # Invariants
//!
//! - For consecutive failures the required wait is non-decreasing
//! - The required wait never exceeds the cap
//! - A success clears the key entirely

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Required wait after `failures` consecutive failures.
///
/// Zero failures means no wait. Saturates instead of overflowing for large
/// failure counts.
pub fn backoff_delay(failures: u32, increment: Duration, cap: Duration) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
    increment.saturating_mul(factor).min(cap)
}

/// Consecutive-failure tracker with exponential backoff.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    /// Base step of the exponential backoff.
    increment: Duration,

    /// Ceiling for the required wait.
    cap: Duration,

    /// Tracked failures: resource_key -> (count, last_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl FailureTracker {
    /// Create a new tracker.
    pub fn new(increment: Duration, cap: Duration) -> Self {
        Self {
            increment,
            cap,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource. Returns the new failure count.
    pub fn record_failure(&mut self, resource_key: &str) -> u32 {
        self.record_failure_at(resource_key, Instant::now())
    }

    pub fn record_failure_at(&mut self, resource_key: &str, now: Instant) -> u32 {
        let (count, last) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));
        *count = count.saturating_add(1);
        *last = now;
        *count
    }

    /// Number of consecutive failures recorded for a resource.
    pub fn failures(&self, resource_key: &str) -> u32 {
        self.failures.get(resource_key).map_or(0, |(count, _)| *count)
    }

    /// Total wait required after the most recent failure.
    pub fn required_wait(&self, resource_key: &str) -> Duration {
        backoff_delay(self.failures(resource_key), self.increment, self.cap)
    }

    /// Time still to wait before the resource may be attempted again, or
    /// `None` when an attempt is allowed now.
    pub fn remaining(&self, resource_key: &str) -> Option<Duration> {
        self.remaining_at(resource_key, Instant::now())
    }

    pub fn remaining_at(&self, resource_key: &str, now: Instant) -> Option<Duration> {
        let (_, last) = self.failures.get(resource_key)?;
        let elapsed = now.saturating_duration_since(*last);
        let required = self.required_wait(resource_key);
        if elapsed < required {
            Some(required - elapsed)
        } else {
            None
        }
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Returns true if nothing is being tracked.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Default base step of fetch backoff.
pub const DEFAULT_BACKOFF_INCREMENT: Duration = Duration::from_millis(500);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_backoff_delay() {
        let inc = Duration::from_millis(500);
        let cap = Duration::from_secs(60);
        assert_eq!(backoff_delay(0, inc, cap), Duration::ZERO);
        assert_eq!(backoff_delay(1, inc, cap), Duration::from_secs(1));
        assert_eq!(backoff_delay(3, inc, cap), Duration::from_secs(4));
        assert_eq!(backoff_delay(20, inc, cap), cap);
        assert_eq!(backoff_delay(u32::MAX, inc, cap), cap);
    }

    #[test]
    fn test_failure_tracker() {
        let mut tracker = FailureTracker::new(Duration::from_millis(500), Duration::from_secs(60));
        let start = Instant::now();

        assert_eq!(tracker.remaining_at("img", start), None);
        assert_eq!(tracker.record_failure_at("img", start), 1);
        assert_eq!(tracker.record_failure_at("img", start), 2);
        assert_eq!(tracker.required_wait("img"), Duration::from_secs(2));

        let later = start + Duration::from_millis(500);
        assert_eq!(
            tracker.remaining_at("img", later),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(tracker.remaining_at("img", start + Duration::from_secs(2)), None);
        assert_eq!(tracker.remaining_at("other", later), None);

        tracker.clear("img");
        assert_eq!(tracker.failures("img"), 0);
        assert!(tracker.is_empty());
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_and_capped(
            k in 0u32..64,
            inc_ms in 1u64..10_000,
            cap_ms in 1u64..10_000_000,
        ) {
            let inc = Duration::from_millis(inc_ms);
            let cap = Duration::from_millis(cap_ms);
            let this = backoff_delay(k, inc, cap);
            let next = backoff_delay(k + 1, inc, cap);
            prop_assert!(this <= next);
            prop_assert!(next <= cap);
        }

        #[test]
        fn tracker_wait_grows_with_consecutive_failures(k in 1usize..40) {
            let cap = Duration::from_secs(900);
            let mut tracker = FailureTracker::new(DEFAULT_BACKOFF_INCREMENT, cap);
            let mut previous = Duration::ZERO;
            for _ in 0..k {
                tracker.record_failure("registry/app:1");
                let wait = tracker.required_wait("registry/app:1");
                prop_assert!(wait >= previous);
                prop_assert!(wait <= cap);
                previous = wait;
            }
        }
    }
}
