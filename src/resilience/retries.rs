//! Reconnect scheduling.
//!
//! A lost duplex channel is re-established on a fixed interval. There is no
//! jitter and no growth: a peer that is down for an hour sees one attempt per
//! interval for that hour.

use std::time::Duration;

/// Schedule for reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    interval: Duration,
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Retry forever, `interval` apart.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    /// Stop after `attempts` failed attempts in a row.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Delay before retrying after `failures` consecutive failures, or `None`
    /// once the policy gives up.
    pub fn next_delay(&self, failures: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if failures >= max => None,
            _ => Some(self.interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_policy_never_gives_up() {
        let policy = RetryPolicy::fixed(Duration::from_secs(60));
        for failures in [1, 10, 10_000, u32::MAX] {
            assert_eq!(policy.next_delay(failures), Some(Duration::from_secs(60)));
        }
    }

    #[test]
    fn bounded_policy_stops() {
        let policy = RetryPolicy::fixed(Duration::from_millis(5)).with_max_attempts(2);
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(5)));
        assert_eq!(policy.next_delay(2), None);
    }
}
