//! Backoff policy for replacing dead worker units

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{duration_millis, ConfigError};

/// How the pool replaces units that crashed or were killed
///
/// The first replacement is immediate. If the replacement itself fails to
/// start, further attempts back off exponentially. Once `max_attempts`
/// consecutive launches for a slot have failed, the slot is abandoned and the
/// pool runs degraded.
///
/// # Example
///
/// ```
/// use scribe_pool::ReplacementPolicy;
/// use std::time::Duration;
///
/// let policy = ReplacementPolicy::exponential()
///     .with_max_attempts(3)
///     .with_initial_interval(Duration::from_millis(200))
///     .with_jitter(0.0);
///
/// assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
/// assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplacementPolicy {
    /// Consecutive launch attempts per slot before giving up
    pub max_attempts: u32,

    /// Delay before the second attempt
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Upper bound on the delay between attempts
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for ReplacementPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl ReplacementPolicy {
    /// Exponential backoff: 5 attempts, 100ms initial, 5s cap, 2x, 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// Fixed interval between attempts
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Set the jitter factor (clamped to 0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Check that every attempt gets a usable delay
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_coefficient.is_finite() || self.backoff_coefficient < 1.0 {
            return Err(ConfigError::InvalidReplacement(
                "backoff_coefficient must be finite and at least 1.0",
            ));
        }
        if self.max_interval < self.initial_interval {
            return Err(ConfigError::InvalidReplacement(
                "max_interval must not be shorter than initial_interval",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::InvalidReplacement(
                "jitter must be between 0.0 and 1.0",
            ));
        }
        Ok(())
    }

    /// Delay before launch attempt `attempt` (1-based)
    ///
    /// Never panics; a policy that fails [`validate`](Self::validate) falls
    /// back to `max_interval`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let exponent = (attempt - 2).min(i32::MAX as u32) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());
        if !capped.is_finite() || capped < 0.0 {
            return self.max_interval;
        }

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let spread = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::try_from_secs_f64(jittered).unwrap_or(self.max_interval)
    }

    /// Whether another attempt is allowed after `attempt` failed
    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
