//! Resilient WebSocket streams for exchange venues.
//!
//! Provides:
//! - Connection state machine with backoff reconnects (`ConnectionManager`)
//! - Desired-set subscription tracking with full replay (`SubscriptionRegistry`)
//! - Ordered, per-channel handler dispatch (`MessageDispatcher`)
//! - Heartbeat liveness detection and private-stream token keepalive
//! - A pluggable `WireAdapter` for venue wire formats

pub mod adapter;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod json_adapter;
pub mod keepalive;
pub mod subscription;
pub mod ws_write_handle;

pub use adapter::{RawFrame, TokenProvider, WireAdapter, WireMessage, WsStream};
pub use connection::{
    ConnectionConfig, ConnectionManager, ConnectionState, ReconnectAttempt, StateTransition,
};
pub use dispatcher::MessageDispatcher;
pub use error::{WsError, WsResult};
pub use heartbeat::HeartbeatMonitor;
pub use json_adapter::{JsonAdapterConfig, JsonWireAdapter};
pub use keepalive::ControlSignal;
pub use subscription::SubscriptionRegistry;
pub use ws_write_handle::{WsOutbound, WsWriteHandle};

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any `wss://` connections are made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
