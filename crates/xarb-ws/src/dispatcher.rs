//! Message dispatch from raw frames to bound handlers.
//!
//! One dispatcher serves one connection. The connection's reader awaits
//! `dispatch` before reading the next frame, so handlers observe frames in
//! arrival order. Nothing is guaranteed across connections.

use crate::adapter::{RawFrame, WireAdapter};
use crate::error::{WsError, WsResult};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};
use xarb_core::{ChannelKey, ParsedMessage};
use xarb_telemetry::Metrics;

/// Async consumer callback for one channel.
pub type Handler = Arc<dyn Fn(ParsedMessage) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct MessageDispatcher {
    /// Stream name for logs and metrics.
    stream: String,
    handlers: DashMap<ChannelKey, Handler>,
}

impl MessageDispatcher {
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            handlers: DashMap::new(),
        }
    }

    /// Bind an async handler to a channel. Rebinding replaces the old handler.
    pub fn bind<F, Fut>(&self, channel_key: ChannelKey, handler: F)
    where
        F: Fn(ParsedMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |msg| Box::pin(handler(msg)));
        if self.handlers.insert(channel_key.clone(), handler).is_some() {
            warn!(stream = %self.stream, channel = %channel_key, "Handler rebound");
        } else {
            debug!(stream = %self.stream, channel = %channel_key, "Handler bound");
        }
    }

    pub fn is_bound(&self, channel_key: &ChannelKey) -> bool {
        self.handlers.contains_key(channel_key)
    }

    pub fn bound_channels(&self) -> Vec<ChannelKey> {
        let mut channels: Vec<_> = self.handlers.iter().map(|e| e.key().clone()).collect();
        channels.sort();
        channels
    }

    /// Decode a frame through the adapter.
    ///
    /// Protocol errors are logged and counted here; the caller drops them.
    pub fn process_raw(&self, adapter: &dyn WireAdapter, frame: RawFrame) -> ParsedMessage {
        let msg = adapter.decode(frame);
        Metrics::ws_message(&self.stream, msg.kind());

        if let ParsedMessage::ProtocolError { reason, raw } = &msg {
            Metrics::ws_protocol_error(&self.stream);
            warn!(
                stream = %self.stream,
                venue = adapter.venue(),
                %reason,
                raw = raw.as_deref().unwrap_or(""),
                "Dropping undecodable frame"
            );
        }
        msg
    }

    /// Route a data message to its handler and await it.
    ///
    /// Non-data messages are ignored. A data message on a channel with no
    /// handler is a configuration error.
    pub async fn dispatch(&self, msg: ParsedMessage) -> WsResult<()> {
        if !msg.is_data() {
            return Ok(());
        }
        let Some(channel_key) = msg.channel_key() else {
            return Ok(());
        };

        // Clone the handler out so no map guard is held across the await.
        let handler = self
            .handlers
            .get(channel_key)
            .map(|entry| Arc::clone(entry.value()));

        match handler {
            Some(handler) => {
                handler(msg).await;
                Ok(())
            }
            None => Err(WsError::UnboundChannel(channel_key.clone())),
        }
    }
}
