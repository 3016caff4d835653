//! Scheduling for the background loops.
//!
//! A successful grant is rescheduled exactly at its lease duration (raised to
//! `min_interval` so a zero or tiny lease cannot spin). Failures back off
//! exponentially from `retry_initial` up to `retry_max`, and the backoff resets
//! on the next success.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::{deserialize_duration, serialize_duration};

fn default_retry_initial() -> Duration {
    Duration::from_secs(1)
}

fn default_retry_max() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_min_interval() -> Duration {
    Duration::from_secs(1)
}

/// Timing policy shared by token renewal and secret refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshPolicy {
    /// Wait before the first retry after a failed refresh.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub retry_initial: Duration,

    /// Ceiling for the retry wait.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub retry_max: Duration,

    /// Shortest allowed wait between two refreshes of the same value.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub min_interval: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            retry_initial: default_retry_initial(),
            retry_max: default_retry_max(),
            min_interval: default_min_interval(),
        }
    }
}

impl RefreshPolicy {
    /// Wait before refreshing a value granted with `lease`.
    pub fn schedule(&self, lease: Duration) -> Duration {
        lease.max(self.min_interval)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial: self.retry_initial,
            max: self.retry_max.max(self.retry_initial),
            failures: 0,
        }
    }
}

/// Exponential retry delay for consecutive failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    /// Record a failure and return how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.failures);
        self.failures = self.failures.saturating_add(1);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures since the last success.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_never_earlier_than_lease() {
        let policy = RefreshPolicy::default();
        assert_eq!(policy.schedule(Duration::from_secs(3600)), Duration::from_secs(3600));
        assert_eq!(policy.schedule(Duration::from_secs(1)), Duration::from_secs(1));
        assert_eq!(policy.schedule(Duration::ZERO), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_doubles_up_to_ceiling() {
        let policy = RefreshPolicy {
            retry_initial: Duration::from_millis(500),
            retry_max: Duration::from_secs(3),
            min_interval: Duration::from_secs(1),
        };
        let mut backoff = policy.backoff();
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(3),
                Duration::from_secs(3),
            ]
        );
        assert_eq!(backoff.failures(), 6);

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_survives_many_failures() {
        let mut backoff = RefreshPolicy::default().backoff();
        for _ in 0..200 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(300));
    }

    #[test]
    fn test_policy_parses_from_toml() {
        let policy: RefreshPolicy = toml::from_str(
            r#"
retry_initial = "250ms"
retry_max = "1m"
"#,
        )
        .unwrap();
        assert_eq!(policy.retry_initial, Duration::from_millis(250));
        assert_eq!(policy.retry_max, Duration::from_secs(60));
        assert_eq!(policy.min_interval, Duration::from_secs(1));
    }
}
