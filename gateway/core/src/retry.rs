//! Bounded retry policy for optimistic-concurrency conflicts.
//!
//! Builds exponential backoff with jitter, capped both in attempts and in the
//! delay between two attempts.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};

/// Default number of attempts, the first one included.
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;
/// Default delay before the first retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Default ceiling on a single delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Retry budget with exponential backoff and jitter.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct RetryConfig {
    /// Total attempts including the first one. Zero behaves like one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Delay before the first retry, doubled on each further retry.
    /// Accepts human-readable durations like "500ms" or "2s".
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound on any single delay.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryConfig {
    /// Creates a tokio-retry strategy yielding `max_attempts - 1` delays.
    ///
    /// With the defaults the delays are roughly 1s, 2s, 4s and 8s, each
    /// jittered and never above `max_backoff`.
    pub fn strategy(&self) -> impl Iterator<Item = Duration> + Send {
        let initial_ms = self.initial_backoff.as_millis() as u64;

        // ExponentialBackoff yields base^n * factor, so base 2 with factor
        // initial/2 starts at the initial delay. Clamp to 1 so sub-2ms values
        // do not collapse into zero delays.
        let factor = (initial_ms / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_backoff)
            .map(jitter)
            .take(self.max_attempts.saturating_sub(1))
    }
}

fn default_max_attempts() -> usize {
    DEFAULT_MAX_ATTEMPTS
}

fn default_initial_backoff() -> Duration {
    DEFAULT_INITIAL_BACKOFF
}

fn default_max_backoff() -> Duration {
    DEFAULT_MAX_BACKOFF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retry_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.initial_backoff, DEFAULT_INITIAL_BACKOFF);
        assert_eq!(config.max_backoff, DEFAULT_MAX_BACKOFF);
    }

    #[test]
    fn test_strategy_is_bounded() {
        let config = RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        };
        assert_eq!(config.strategy().count(), 2);
    }

    #[test]
    fn test_single_attempt_has_no_retries() {
        let config = RetryConfig {
            max_attempts: 1,
            ..Default::default()
        };
        assert_eq!(config.strategy().count(), 0);

        let config = RetryConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(config.strategy().count(), 0);
    }

    #[test]
    fn test_delays_respect_ceiling() {
        let config = RetryConfig {
            max_attempts: 12,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(4),
        };
        for delay in config.strategy() {
            assert!(delay <= Duration::from_secs(4));
        }
    }

    #[test]
    fn test_sub_2ms_does_not_produce_zero_delays() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_secs(1),
        };
        for delay in config.strategy() {
            assert!(delay > Duration::ZERO, "delay must not be zero");
        }
    }

    #[test]
    fn test_deserialize_humantime() {
        let yaml = r#"
            max_attempts: 8
            initial_backoff: "250ms"
            max_backoff: "10s"
        "#;
        let config: RetryConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.max_attempts, 8);
        assert_eq!(config.initial_backoff, Duration::from_millis(250));
        assert_eq!(config.max_backoff, Duration::from_secs(10));
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: RetryConfig = serde_yaml::from_str("initial_backoff: 2s").unwrap();
        assert_eq!(config.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.initial_backoff, Duration::from_secs(2));
        assert_eq!(config.max_backoff, DEFAULT_MAX_BACKOFF);
    }
}
