//! Reconnection backoff policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff for stream reconnects.
///
/// `delay(attempt) = min(initial_delay * backoff_factor^(attempt-1), max_delay)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectionPolicy {
    /// Maximum reconnection attempts (0 = unlimited).
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl ReconnectionPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        backoff_factor: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            backoff_factor,
            max_delay,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based; 0 is treated as 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_factor.max(1.0).powi(exponent);
        let secs = self.initial_delay.as_secs_f64() * factor;
        let max_secs = self.max_delay.as_secs_f64();

        if !secs.is_finite() || secs >= max_secs {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Whether `attempt` is beyond the allowed budget.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt > self.max_attempts
    }
}
