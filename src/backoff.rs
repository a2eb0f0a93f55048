//! Per-message retry scheduling
//!
//! A message that failed a delivery attempt gets a [`BackoffEntry`] keyed by
//! its id. Until `next_eligible_at` passes it is skipped by delivery. The
//! tracker has no lock of its own: it lives inside the buffer state and is
//! guarded by the buffer's lock.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Furthest a retry is ever pushed out when `now + delay` is not representable
const MAX_HORIZON: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Exponential backoff parameters
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay unit; attempt `n` waits `base * 2^n`
    pub base: Duration,

    /// Ceiling on any single delay
    pub max_delay: Duration,

    /// How long an entry may outlive its `next_eligible_at` before the
    /// retention sweep discards it
    pub grace: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(5 * 60),
            grace: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based): `min(base * 2^attempt, max_delay)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        // 2^31 seconds is far past any sane cap
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Scheduling state for one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffEntry {
    /// Failed attempts so far
    pub attempt_count: u32,

    /// Earliest time the message may be attempted again
    pub next_eligible_at: Instant,

    /// Delay ceiling the entry was computed with
    pub max_delay: Duration,
}

/// Backoff entries keyed by message id
#[derive(Debug, Default)]
pub struct BackoffTracker {
    policy: BackoffPolicy,
    entries: HashMap<String, BackoffEntry>,
}

impl BackoffTracker {
    /// Create an empty tracker
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
        }
    }

    /// Get the policy
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Store or refresh the entry for `id` after its `attempt`-th failure,
    /// returning the delay applied
    pub fn schedule(&mut self, id: &str, attempt: u32, now: Instant) -> Duration {
        let delay = self.policy.delay_for(attempt);
        self.entries.insert(
            id.to_string(),
            BackoffEntry {
                attempt_count: attempt,
                next_eligible_at: later(now, delay),
                max_delay: self.policy.max_delay,
            },
        );
        delay
    }

    /// Whether `id` is outside any backoff window at `now`
    pub fn is_eligible(&self, id: &str, now: Instant) -> bool {
        match self.entries.get(id) {
            Some(entry) => now >= entry.next_eligible_at,
            None => true,
        }
    }

    /// Get the entry for `id`
    pub fn get(&self, id: &str) -> Option<&BackoffEntry> {
        self.entries.get(id)
    }

    /// Drop the entry for `id`, if any
    pub fn remove(&mut self, id: &str) -> Option<BackoffEntry> {
        self.entries.remove(id)
    }

    /// Drop entries whose `next_eligible_at + grace` has passed; returns how many
    ///
    /// An entry whose deadline is not representable is never swept.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let grace = self.policy.grace;
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            entry
                .next_eligible_at
                .checked_add(grace)
                .map_or(true, |deadline| now <= deadline)
        });
        before - self.entries.len()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `at + delay`, saturating at `MAX_HORIZON` past `at`
fn later(at: Instant, delay: Duration) -> Instant {
    at.checked_add(delay)
        .or_else(|| at.checked_add(MAX_HORIZON))
        .unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(8), Duration::from_secs(256));
        assert_eq!(policy.delay_for(9), Duration::from_secs(300));
        assert_eq!(policy.delay_for(200), Duration::from_secs(300));
    }

    #[test]
    fn test_delay_with_custom_base() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
    }

    #[test]
    fn test_schedule_and_eligibility() {
        let mut tracker = BackoffTracker::default();
        let now = Instant::now();

        assert!(tracker.is_eligible("a", now));

        let delay = tracker.schedule("a", 1, now);
        assert_eq!(delay, Duration::from_secs(2));
        assert!(!tracker.is_eligible("a", now));
        assert!(!tracker.is_eligible("a", now + Duration::from_millis(1999)));
        assert!(tracker.is_eligible("a", now + Duration::from_secs(2)));

        let entry = tracker.get("a").unwrap();
        assert_eq!(entry.attempt_count, 1);
        assert_eq!(entry.max_delay, Duration::from_secs(300));
    }

    #[test]
    fn test_reschedule_refreshes_entry() {
        let mut tracker = BackoffTracker::default();
        let now = Instant::now();
        tracker.schedule("a", 1, now);
        tracker.schedule("a", 2, now);

        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.get("a").unwrap().attempt_count, 2);
        assert_eq!(
            tracker.get("a").unwrap().next_eligible_at,
            now + Duration::from_secs(4)
        );
    }

    #[test]
    fn test_sweep_respects_grace() {
        let mut tracker = BackoffTracker::new(BackoffPolicy {
            grace: Duration::from_secs(60),
            ..Default::default()
        });
        let now = Instant::now();
        tracker.schedule("old", 1, now);
        tracker.schedule("new", 8, now);

        // "old" became eligible at +2s, its grace ends at +62s
        assert_eq!(tracker.sweep(now + Duration::from_secs(62)), 0);
        assert_eq!(tracker.sweep(now + Duration::from_secs(63)), 1);
        assert!(tracker.get("old").is_none());
        assert!(tracker.get("new").is_some());
    }

    #[test]
    fn test_remove() {
        let mut tracker = BackoffTracker::default();
        tracker.schedule("a", 1, Instant::now());
        assert!(tracker.remove("a").is_some());
        assert!(tracker.remove("a").is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_huge_delays_do_not_overflow() {
        let mut tracker = BackoffTracker::new(BackoffPolicy {
            base: Duration::from_secs(u64::MAX),
            max_delay: Duration::from_secs(u64::MAX),
            grace: Duration::from_secs(u64::MAX),
        });
        let now = Instant::now();

        tracker.schedule("a", 3, now);
        let entry = tracker.get("a").unwrap();
        assert!(entry.next_eligible_at > now);
        assert!(!tracker.is_eligible("a", now + Duration::from_secs(3600)));

        // Deadline past the representable range: kept, not panicking
        assert_eq!(tracker.sweep(now + Duration::from_secs(3600)), 0);
        assert_eq!(tracker.len(), 1);
    }
}
