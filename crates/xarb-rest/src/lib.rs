//! REST request layer for exchange venues.
//!
//! Every outbound call goes through:
//! - `RateLimiter`: per-endpoint token buckets plus a global in-flight cap
//! - `RetryExecutor`: typed retry decisions with venue-aware backoff
//! - `RequestSigner`: venue-specific request authentication
//!
//! `RestClient` wires the three together behind `request` and `post_order`.

pub mod client;
pub mod error;
pub mod rate_limiter;
pub mod retry;
pub mod signer;

pub use client::{RestClient, RestConfig, RestResponse};
pub use error::{RestError, RestResult};
pub use rate_limiter::{BucketConfig, RateLimiter, RateLimiterConfig, RatePermit};
pub use retry::{Idempotency, RetryConfig, RetryContext, RetryExecutor};
pub use signer::{ApiKeySigner, NoSigner, RequestSigner};
