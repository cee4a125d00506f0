//! Reconnect delay policy: exponential growth from `base_delay`, capped at `max_delay`.

use std::time::Duration;

/// Exponential backoff without jitter. `attempt` is 0-indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Reconnects scheduled before the session gives up.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// `min(base_delay * 2^attempt, max_delay)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// True once `attempt` reconnects have already been scheduled.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(4), Duration::from_secs(10));
        assert_eq!(policy.delay(40), Duration::from_secs(10));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn delay_is_monotonic() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(150),
            max_delay: Duration::from_secs(7),
            max_attempts: 5,
        };
        let mut previous = Duration::ZERO;
        let mut reached_cap = false;
        for attempt in 0..64 {
            let delay = policy.delay(attempt);
            assert!(delay >= previous, "attempt {attempt} went backwards");
            if reached_cap {
                assert_eq!(delay, policy.max_delay);
            }
            reached_cap |= delay == policy.max_delay;
            previous = delay;
        }
        assert!(reached_cap);
    }

    #[test]
    fn exhaustion_counts_scheduled_attempts() {
        let policy = BackoffPolicy::default();
        assert!(!policy.exhausted(0));
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
    }
}
