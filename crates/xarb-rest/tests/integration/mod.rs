//! Integration tests for xarb-rest.
//!
//! These tests run `RestClient` against a scripted local venue:
//! - Retry routing by HTTP status
//! - Idempotency keys on order submission
//! - Per-attempt timeouts

pub mod common;
