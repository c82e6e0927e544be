//! Rate limiting for outbound REST calls.
//!
//! Two layers:
//! - a global semaphore capping concurrent in-flight requests
//! - one token bucket per endpoint pattern (capacity, continuous refill,
//!   minimum spacing between grants)
//!
//! A caller takes a global slot, then waits on its bucket's mutex (served in
//! FIFO order) until tokens and spacing allow a grant. Tokens are charged only
//! at that point, with the slot already held.

use crate::error::{RestError, RestResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as TokioMutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, trace};
use xarb_telemetry::Metrics;

/// Token shortfall below which a bucket counts as refilled.
const EPSILON: f64 = 1e-9;

/// One endpoint bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketConfig {
    /// Exact endpoint path, or a prefix ending in `*`.
    pub pattern: String,
    /// Maximum tokens held (burst size).
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Minimum spacing between grants.
    pub min_interval: Duration,
    /// Weight charged when the caller does not specify one.
    pub weight: u32,
}

impl BucketConfig {
    pub fn new(pattern: impl Into<String>, capacity: u32, refill_rate: f64) -> Self {
        Self {
            pattern: pattern.into(),
            capacity,
            refill_rate,
            min_interval: Duration::ZERO,
            weight: 1,
        }
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    fn validate(&self) -> RestResult<()> {
        if self.capacity == 0 {
            return Err(RestError::InvalidRequest(format!(
                "bucket {} has zero capacity",
                self.pattern
            )));
        }
        if !(self.refill_rate.is_finite() && self.refill_rate > 0.0) {
            return Err(RestError::InvalidRequest(format!(
                "bucket {} has invalid refill rate {}",
                self.pattern, self.refill_rate
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Global cap on concurrent in-flight requests.
    pub max_in_flight: usize,
    pub endpoints: Vec<BucketConfig>,
    /// Bucket for endpoints no pattern matches.
    pub default_bucket: BucketConfig,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 10,
            endpoints: Vec::new(),
            default_bucket: BucketConfig::new("*", 5, 5.0),
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
    min_interval: Duration,
    last_grant: Option<Instant>,
}

impl TokenBucket {
    fn new(config: &BucketConfig) -> Self {
        Self {
            capacity: f64::from(config.capacity),
            refill_rate: config.refill_rate,
            tokens: f64::from(config.capacity),
            last_refill: Instant::now(),
            min_interval: config.min_interval,
            last_grant: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Time until `weight` can be granted. Zero means grant now.
    fn wait_time(&self, weight: f64, now: Instant) -> Duration {
        let deficit = weight - self.tokens;
        let token_wait = if deficit <= EPSILON {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(deficit / self.refill_rate)
        };
        let spacing_wait = self
            .last_grant
            .map(|grant| (grant + self.min_interval).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);
        token_wait.max(spacing_wait)
    }

    fn grant(&mut self, weight: f64, now: Instant) {
        self.tokens = (self.tokens - weight).max(0.0);
        self.last_grant = Some(now);
    }
}

struct Bucket {
    pattern: String,
    weight: u32,
    capacity: u32,
    state: TokioMutex<TokenBucket>,
}

impl Bucket {
    fn new(config: &BucketConfig) -> Self {
        Self {
            pattern: config.pattern.clone(),
            weight: config.weight,
            capacity: config.capacity,
            state: TokioMutex::new(TokenBucket::new(config)),
        }
    }

    /// Match specificity for `endpoint`, longest match first. Exact beats prefix.
    fn specificity(&self, endpoint: &str) -> Option<(usize, bool)> {
        match self.pattern.strip_suffix('*') {
            Some(prefix) if endpoint.starts_with(prefix) => Some((prefix.len(), false)),
            Some(_) => None,
            None if self.pattern == endpoint => Some((self.pattern.len(), true)),
            None => None,
        }
    }
}

/// Grant from `RateLimiter::acquire`. Holds a global in-flight slot until
/// dropped.
#[derive(Debug)]
pub struct RatePermit {
    _slot: OwnedSemaphorePermit,
    pattern: String,
    waited: Duration,
}

impl RatePermit {
    /// Pattern of the bucket that granted this permit.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Time spent waiting for the grant.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Return the in-flight slot now.
    pub fn release(self) {}
}

pub struct RateLimiter {
    global: Arc<Semaphore>,
    max_in_flight: usize,
    buckets: Vec<Bucket>,
    default_bucket: Bucket,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> RestResult<Self> {
        if config.max_in_flight == 0 {
            return Err(RestError::InvalidRequest(
                "max_in_flight must be positive".to_string(),
            ));
        }
        config.default_bucket.validate()?;
        for bucket in &config.endpoints {
            bucket.validate()?;
        }

        Ok(Self {
            global: Arc::new(Semaphore::new(config.max_in_flight)),
            max_in_flight: config.max_in_flight,
            buckets: config.endpoints.iter().map(Bucket::new).collect(),
            default_bucket: Bucket::new(&config.default_bucket),
        })
    }

    fn bucket_for(&self, endpoint: &str) -> &Bucket {
        self.buckets
            .iter()
            .filter_map(|b| b.specificity(endpoint).map(|s| (s, b)))
            .max_by_key(|(s, _)| *s)
            .map(|(_, b)| b)
            .unwrap_or(&self.default_bucket)
    }

    /// Pattern of the bucket `endpoint` resolves to.
    pub fn pattern_for(&self, endpoint: &str) -> &str {
        &self.bucket_for(endpoint).pattern
    }

    /// Configured default weight for `endpoint`.
    pub fn weight_for(&self, endpoint: &str) -> u32 {
        self.bucket_for(endpoint).weight
    }

    /// Free global in-flight slots.
    pub fn available_slots(&self) -> usize {
        self.global.available_permits()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Wait until `endpoint` may send a request of `weight`.
    pub async fn acquire(&self, endpoint: &str, weight: u32) -> RestResult<RatePermit> {
        let bucket = self.bucket_for(endpoint);
        if weight > bucket.capacity {
            return Err(RestError::InvalidRequest(format!(
                "weight {weight} exceeds capacity {} of bucket {}",
                bucket.capacity, bucket.pattern
            )));
        }

        let started = Instant::now();
        let weight_f = f64::from(weight);

        // Tokens are charged only once the slot is held and the bucket allows
        // it. Dropping this future before then charges nothing.
        let slot = Arc::clone(&self.global)
            .acquire_owned()
            .await
            .map_err(|_| RestError::InvalidRequest("rate limiter closed".to_string()))?;

        {
            // The lock is held while sleeping so later callers queue behind us.
            let mut state = bucket.state.lock().await;
            loop {
                let now = Instant::now();
                state.refill(now);
                let wait = state.wait_time(weight_f, now);
                if wait.is_zero() {
                    state.grant(weight_f, now);
                    break;
                }
                trace!(endpoint, pattern = %bucket.pattern, wait_ms = wait.as_millis() as u64, "Waiting for tokens");
                tokio::time::sleep(wait).await;
            }
        }

        let waited = started.elapsed();
        Metrics::rate_limit_wait(&bucket.pattern, waited.as_secs_f64() * 1000.0);
        if !waited.is_zero() {
            debug!(endpoint, pattern = %bucket.pattern, waited_ms = waited.as_millis() as u64, "Rate limit wait");
        }

        Ok(RatePermit {
            _slot: slot,
            pattern: bucket.pattern.clone(),
            waited,
        })
    }
}
