//! Bounded exponential backoff for reconnecting sockets.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_ms;

/// Reconnect policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Consecutive failed attempts allowed before giving up. `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_retries: Some(10),
        }
    }
}

impl BackoffConfig {
    /// The same curve without a retry limit.
    pub fn unbounded(mut self) -> Self {
        self.max_retries = None;
        self
    }

    /// Delay before retry number `attempt` (1-based): `initial * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Tracks consecutive failures against a [`BackoffConfig`].
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
}

impl Backoff {
    /// Starts with no recorded failures.
    pub fn new(config: BackoffConfig) -> Self {
        Backoff {
            config,
            failures: 0,
        }
    }

    /// Records a failure and returns how long to wait before retrying, or `None` once retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if let Some(max) = self.config.max_retries {
            if self.failures > max {
                return None;
            }
        }
        Some(self.config.delay_for(self.failures))
    }

    /// Clears the failure count after a successful connection.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures recorded so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            max_retries: Some(5),
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let config = config();
        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(400));
        assert_eq!(config.delay_for(4), Duration::from_millis(800));
        // capped
        assert_eq!(config.delay_for(5), Duration::from_millis(1000));
        assert_eq!(config.delay_for(40), Duration::from_millis(1000));
    }

    #[test]
    fn retries_are_bounded() {
        let mut backoff = Backoff::new(config());
        for _ in 0..5 {
            assert!(backoff.next_delay().is_some());
        }
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.failures(), 6);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn unbounded_never_gives_up() {
        let mut backoff = Backoff::new(config().unbounded());
        for _ in 0..1000 {
            assert!(backoff.next_delay().is_some());
        }
    }
}
