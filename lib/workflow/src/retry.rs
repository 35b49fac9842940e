//! Retry policy for transient node failures.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 means no retries).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Creates a configuration with the given retry count and first delay.
    #[must_use]
    pub fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff_ms: u64::try_from(initial_backoff.as_millis()).unwrap_or(u64::MAX),
            ..Self::default()
        }
    }

    /// Creates a configuration with no retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Returns the delay before retry number `retry` (zero-based).
    #[must_use]
    pub fn calculate_backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let millis = (self.initial_backoff_ms as f64) * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Returns the delay before retry number `retry`, honoring a
    /// provider-supplied `Retry-After` up to the backoff ceiling.
    #[must_use]
    pub fn delay_for(&self, retry: u32, retry_after_secs: Option<u64>) -> Duration {
        let computed = self.calculate_backoff(retry);
        match retry_after_secs {
            Some(secs) => Duration::from_secs(secs)
                .min(Duration::from_millis(self.max_backoff_ms))
                .max(computed),
            None => computed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_backoff_ms, 200);
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = RetryConfig::new(5, Duration::from_millis(100));
        assert_eq!(config.calculate_backoff(0), Duration::from_millis(100));
        assert_eq!(config.calculate_backoff(1), Duration::from_millis(200));
        assert_eq!(config.calculate_backoff(2), Duration::from_millis(400));
        assert_eq!(config.calculate_backoff(20), Duration::from_secs(10));
    }

    #[test]
    fn retry_after_is_honored_within_ceiling() {
        let config = RetryConfig::new(3, Duration::from_millis(100));
        assert_eq!(config.delay_for(0, Some(2)), Duration::from_secs(2));
        assert_eq!(config.delay_for(0, Some(600)), Duration::from_secs(10));
        assert_eq!(RetryConfig::no_retry().delay_for(4, None), Duration::ZERO);
    }
}
