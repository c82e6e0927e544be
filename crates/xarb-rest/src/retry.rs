//! Retry decisions and backoff for REST calls.
//!
//! Retryable: rate limits, connection errors, timeouts, 5xx.
//! Never retried: auth failures and request validation errors.
//! Mutating calls are retried only when they carry an idempotency key.

use crate::error::{RestError, RestResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};
use xarb_core::ErrorKind;
use xarb_telemetry::Metrics;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Whether a call may safely be sent more than once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Idempotency {
    /// Reads and other calls without side effects.
    Safe,
    /// Calls that change venue state. Retried only with a key the venue
    /// deduplicates on.
    Mutating { key: Option<String> },
}

impl Idempotency {
    pub fn mutating(key: impl Into<String>) -> Self {
        Self::Mutating {
            key: Some(key.into()),
        }
    }

    pub fn allows_retry(&self) -> bool {
        match self {
            Self::Safe => true,
            Self::Mutating { key } => key.is_some(),
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Safe => None,
            Self::Mutating { key } => key.as_deref(),
        }
    }
}

/// Progress of one logical call.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    /// Attempts made so far.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Failed attempts, oldest first.
    pub error_history: Vec<RestError>,
}

impl RetryContext {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            error_history: Vec::new(),
        }
    }

    pub fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt)
    }
}

#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether another attempt should follow failed attempt number `attempt`.
    pub fn should_retry(&self, attempt: u32, error: &RestError) -> bool {
        if attempt >= self.config.max_attempts {
            return false;
        }
        is_retryable(error)
    }

    /// Delay before the attempt after failed attempt number `attempt`.
    pub fn delay(&self, attempt: u32, error: &RestError) -> Duration {
        if let Some(retry_after) = error.retry_after() {
            return retry_after;
        }

        let base = self.config.base_delay.as_secs_f64();
        let factor = match error.kind() {
            ErrorKind::RateLimit => 3f64.powi(attempt.min(64) as i32),
            _ => 2f64.powi(attempt.saturating_sub(1).min(64) as i32),
        };
        let secs = base * factor;
        if !secs.is_finite() || secs >= self.config.max_delay.as_secs_f64() {
            return self.config.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Run `op` until it succeeds or the retry budget is spent.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(
        &self,
        endpoint: &str,
        idempotency: &Idempotency,
        mut op: F,
    ) -> RestResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = RestResult<T>>,
    {
        let max_attempts = if idempotency.allows_retry() {
            self.config.max_attempts.max(1)
        } else {
            1
        };
        let mut ctx = RetryContext::new(max_attempts);

        loop {
            ctx.attempt += 1;
            let error = match op(ctx.attempt).await {
                Ok(value) => {
                    if ctx.attempt > 1 {
                        debug!(endpoint, attempts = ctx.attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !is_retryable(&error) {
                debug!(endpoint, error = %error, "Not retryable");
                return Err(error);
            }
            if !idempotency.allows_retry() {
                warn!(endpoint, error = %error, "Mutating call without idempotency key, not retrying");
                return Err(error);
            }
            if ctx.attempt >= ctx.max_attempts || !self.should_retry(ctx.attempt, &error) {
                warn!(endpoint, attempts = ctx.attempt, error = %error, "Retries exhausted");
                ctx.error_history.push(error.clone());
                return Err(RestError::RetriesExhausted {
                    attempts: ctx.attempt,
                    last: Box::new(error),
                    history: ctx.error_history,
                });
            }

            let delay = self.delay(ctx.attempt, &error);
            let kind = error.kind();
            Metrics::rest_retry(endpoint, kind.as_str());
            warn!(
                endpoint,
                attempt = ctx.attempt,
                remaining = ctx.remaining(),
                delay_ms = delay.as_millis() as u64,
                kind = kind.as_str(),
                error = %error,
                "Retrying"
            );
            ctx.error_history.push(error);
            tokio::time::sleep(delay).await;
        }
    }
}

fn is_retryable(error: &RestError) -> bool {
    matches!(
        error.kind(),
        ErrorKind::RateLimit | ErrorKind::ConnectionError | ErrorKind::Timeout | ErrorKind::Server
    )
}
