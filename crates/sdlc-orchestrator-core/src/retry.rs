// Copyright (c) 2025 SDLC Platform
// SPDX-License-Identifier: Apache-2.0

//! Retry backoff policy.
//!
//! Delays follow `initial_delay * multiplier^(attempt)` with proportional
//! jitter (±10%), capped at `max_delay`. The executor owns the retry loop so
//! it can interleave timeouts, cancellation, and retry events.

use rand::Rng;
use std::time::Duration;

use crate::workflow::{BackoffStrategy, RetryConfig};

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries).
    pub max_attempts: u32,

    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Multiplier for exponential backoff (typically 2.0).
    pub multiplier: f64,

    /// Maximum delay between retries.
    pub max_delay: Duration,

    /// Whether to add jitter to prevent thundering herd.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings.
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            multiplier,
            max_delay,
            jitter: true,
        }
    }

    /// Creates a retry policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(0),
            multiplier: 1.0,
            max_delay: Duration::from_millis(0),
            jitter: false,
        }
    }

    /// Calculates the delay for a given retry number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt >= self.max_attempts {
            return Duration::from_millis(0);
        }

        let base_delay_ms =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = std::cmp::min(
            Duration::from_millis(base_delay_ms as u64),
            self.max_delay,
        );

        if self.jitter {
            add_jitter(capped)
        } else {
            capped
        }
    }

    /// Returns true if retries are enabled.
    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }

    /// Total attempt budget including the initial try.
    pub fn total_attempts(&self) -> u32 {
        self.max_attempts + 1
    }
}

/// Proportional jitter: random value between 90% and 110% of the delay.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor = rng.gen_range(0.9..=1.1);
    Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        let multiplier = match config.backoff {
            BackoffStrategy::Exponential => 2.0,
            BackoffStrategy::Linear => 1.0,
            BackoffStrategy::Constant => 1.0,
        };
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.initial_delay_ms),
            multiplier,
            Duration::from_millis(config.max_delay_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert_eq!(policy.multiplier, 2.0);
        assert!(policy.is_enabled());
        assert_eq!(policy.total_attempts(), 4);
    }

    #[test]
    fn test_no_retry_policy() {
        let policy = RetryPolicy::no_retry();
        assert!(!policy.is_enabled());
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(0));
    }

    #[test]
    fn test_exponential_backoff_without_jitter() {
        let mut policy = RetryPolicy::new(
            5,
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(10),
        );
        policy.jitter = false;

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn test_max_delay_cap() {
        let mut policy = RetryPolicy::new(
            10,
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(1),
        );
        policy.jitter = false;

        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_proportional() {
        let policy = RetryPolicy::new(
            3,
            Duration::from_millis(1000),
            2.0,
            Duration::from_secs(10),
        );

        for _ in 0..20 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay.as_millis() >= 900 && delay.as_millis() <= 1100);
        }
    }

    #[test]
    fn test_from_config() {
        let config = RetryConfig {
            max_attempts: 5,
            backoff: BackoffStrategy::Exponential,
            initial_delay_ms: 200,
            max_delay_ms: 10000,
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(200));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.max_delay, Duration::from_millis(10000));
    }
}
