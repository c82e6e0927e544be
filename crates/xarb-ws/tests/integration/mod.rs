//! Integration tests for xarb-ws.
//!
//! These tests run a `ConnectionManager` against a local mock venue:
//! - Connection lifecycle and reconnect sequencing
//! - Subscription replay after a dropped connection
//! - Heartbeat liveness and private-stream auth

pub mod common;
