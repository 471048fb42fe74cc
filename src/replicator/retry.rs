//! Backoff policy for unit retries

use crate::config::RetryConfig;
use crate::error::{ErrorClass, ReplicationError};
use std::time::Duration;

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier.max(1.0),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-based)
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Decide whether to retry after `attempt` failed with `error`.
    ///
    /// Transient failures retry until `max_attempts`; an integrity mismatch gets
    /// exactly one extra attempt per unit run (`integrity_retried` records whether
    /// it was already spent); everything else is terminal.
    pub fn decide(
        &self,
        error: &ReplicationError,
        attempt: u32,
        integrity_retried: bool,
    ) -> RetryDecision {
        match error.class() {
            ErrorClass::Retryable if attempt < self.max_attempts => {
                RetryDecision::RetryAfter(self.next_delay(attempt))
            }
            ErrorClass::RetryOnce if !integrity_retried => {
                RetryDecision::RetryAfter(self.next_delay(1))
            }
            _ => RetryDecision::GiveUp,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}
