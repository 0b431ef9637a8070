//! Retry policy with exponential backoff.
//!
//! Used by the job dispatcher for handler failures and by the supervisor for
//! restarting crashed plugin contexts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub exponential_base: f64,
    /// Jitter factor in `[0.0, 1.0]`.
    #[serde(default)]
    pub jitter_factor: f64,
}

impl RetryConfig {
    /// Creates a new retry configuration without jitter.
    #[must_use]
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            exponential_base: 2.0,
            jitter_factor: 0.0,
        }
    }

    /// A single attempt and no retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            exponential_base: 2.0,
            jitter_factor: 0.0,
        }
    }

    /// Sets the jitter factor.
    #[must_use]
    pub const fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    /// Delay to wait after `failed_attempts` failures (1-indexed).
    ///
    /// Returns `Duration::ZERO` for 0, then `initial_delay * base^(n-1)`
    /// capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_for_attempt(&self, failed_attempts: u32) -> Duration {
        if failed_attempts == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(failed_attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_ms = self.initial_delay.as_millis() as f64 * self.exponential_base.powi(exponent);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms.max(0.0) as u64)
    }

    /// Delay with jitter applied; `random_factor` is expected in `[0.0, 1.0]`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_with_jitter(&self, failed_attempts: u32, random_factor: f64) -> Duration {
        let base = self.delay_for_attempt(failed_attempts);
        if self.jitter_factor <= 0.0 {
            return base;
        }
        let random_factor = random_factor.clamp(0.0, 1.0);
        let multiplier = 1.0 - self.jitter_factor + (2.0 * self.jitter_factor * random_factor);
        let jittered = (base.as_millis() as f64 * multiplier).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    #[must_use]
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter_factor: 0.1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let cfg = RetryConfig::new(10, Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(cfg.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(cfg.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(cfg.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(cfg.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(cfg.delay_for_attempt(5), Duration::from_millis(1000));
        assert_eq!(cfg.delay_for_attempt(40), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_in_band() {
        let cfg = RetryConfig::new(5, Duration::from_millis(1000), Duration::from_secs(10))
            .with_jitter(0.2);
        let low = cfg.delay_with_jitter(1, 0.0).as_millis();
        let high = cfg.delay_with_jitter(1, 1.0).as_millis();
        assert!((799..=801).contains(&low), "{low}");
        assert!((1199..=1201).contains(&high), "{high}");
    }

    #[test]
    fn attempt_ceiling() {
        let cfg = RetryConfig::new(3, Duration::from_millis(1), Duration::from_millis(1));
        assert!(cfg.should_retry(1));
        assert!(cfg.should_retry(2));
        assert!(!cfg.should_retry(3));
        assert!(!RetryConfig::no_retry().should_retry(1));
    }
}
