//! Venue wire adapter contract.
//!
//! Everything venue specific (URLs, auth handshake, subscription frames,
//! payload decoding, error classification) lives behind `WireAdapter`.
//! The connection manager, registry and dispatcher only speak to this trait.

use crate::error::{WsError, WsResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use xarb_core::{ErrorKind, ParsedMessage, ReconnectionPolicy, SubscriptionAction, SubscriptionEntry};

/// Transport handle produced by `WireAdapter::connect`.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound data frame as received from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Outbound frame produced by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl From<WireMessage> for Message {
    fn from(msg: WireMessage) -> Self {
        match msg {
            WireMessage::Text(text) => Message::Text(text),
            WireMessage::Binary(bytes) => Message::Binary(bytes),
        }
    }
}

impl From<WireMessage> for RawFrame {
    fn from(msg: WireMessage) -> Self {
        match msg {
            WireMessage::Text(text) => RawFrame::Text(text),
            WireMessage::Binary(bytes) => RawFrame::Binary(bytes),
        }
    }
}

/// Source of private-stream session tokens (listen keys).
///
/// Acquisition and renewal usually go through the venue's REST API, which is
/// why this is injected rather than built into the adapter.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Create a fresh token.
    async fn acquire(&self) -> WsResult<String>;

    /// Extend the lifetime of an existing token.
    async fn refresh(&self, token: &str) -> WsResult<()>;
}

#[async_trait]
pub trait WireAdapter: Send + Sync + 'static {
    /// Venue name for logs.
    fn venue(&self) -> &str;

    /// Open a new transport. Called once per connection attempt.
    async fn connect(&self) -> WsResult<WsStream>;

    /// Whether `authenticate` must run before subscribing.
    fn requires_auth(&self) -> bool {
        false
    }

    /// Perform the venue auth handshake. `Ok(false)` means the venue
    /// rejected the credentials.
    async fn authenticate(&self, _stream: &mut WsStream) -> WsResult<bool> {
        Ok(true)
    }

    fn get_reconnection_policy(&self) -> ReconnectionPolicy;

    fn classify(&self, error: &WsError) -> ErrorKind {
        error.kind()
    }

    fn should_reconnect(&self, error: &WsError) -> bool {
        !error.is_terminal() && self.classify(error).is_reconnectable()
    }

    /// Application-level heartbeat frame. `None` falls back to a protocol ping.
    fn handle_heartbeat(&self) -> Option<WireMessage> {
        None
    }

    fn encode_subscription(
        &self,
        action: SubscriptionAction,
        entry: &SubscriptionEntry,
    ) -> WsResult<Vec<WireMessage>>;

    /// Decode one frame. Must not fail: undecodable input becomes
    /// `ParsedMessage::ProtocolError`.
    fn decode(&self, frame: RawFrame) -> ParsedMessage;

    /// How often the session token must be refreshed. `None` for public streams.
    fn keepalive_interval(&self) -> Option<Duration> {
        None
    }

    async fn refresh_token(&self) -> WsResult<()> {
        Ok(())
    }

    /// Replace the session token after a failed refresh.
    async fn regenerate_token(&self) -> WsResult<()> {
        Ok(())
    }
}
