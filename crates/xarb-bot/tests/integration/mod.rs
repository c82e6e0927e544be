//! Integration tests for xarb-bot.
//!
//! These tests run the whole application against a mock venue:
//! - Public stream subscription and event dispatch
//! - Private stream listen-key acquisition over REST
//! - Shutdown on the first fatal stream error

pub mod common;
