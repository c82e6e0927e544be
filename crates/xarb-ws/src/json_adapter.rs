//! Reference JSON wire adapter.
//!
//! Wire format:
//! - subscribe: `{"op":"subscribe","channel":"depth","symbol":"BTCUSDT"}`
//! - data: `{"channel":"depth","symbol":"BTCUSDT","type":"order_book","data":{..}}`
//! - ack: `{"event":"subscribed","channel":..,"symbol":..}` (an echoed
//!   `op` frame is accepted as an ack too)
//! - heartbeat: we send `{"op":"ping"}`, the venue answers `{"event":"pong"}`
//! - auth: `{"op":"auth","token":..}` answered by `{"event":"auth","success":true}`,
//!   unless the URL carries a `{token}` placeholder (listen-key style)
//!
//! Binary frames carry the same JSON as UTF-8.

use crate::adapter::{RawFrame, TokenProvider, WireAdapter, WireMessage, WsStream};
use crate::error::{WsError, WsResult};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::connect_async_tls_with_config;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use xarb_core::{
    ChannelKey, ErrorKind, ParsedMessage, ReconnectionPolicy, SubscriptionAction,
    SubscriptionEntry,
};

const TOKEN_PLACEHOLDER: &str = "{token}";

/// Reference adapter configuration.
#[derive(Debug, Clone)]
pub struct JsonAdapterConfig {
    /// Stream URL. May contain `{token}` for listen-key streams.
    pub url: String,
    pub venue: String,
    pub connect_timeout: Duration,
    /// How long to wait for the auth reply.
    pub auth_timeout: Duration,
    pub policy: ReconnectionPolicy,
    /// Close codes that always warrant a reconnect, whatever their default
    /// classification.
    pub reconnect_close_codes: Vec<u16>,
    /// Token refresh cadence. Only used with a token provider.
    pub keepalive_interval: Option<Duration>,
}

impl Default for JsonAdapterConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            venue: "json".to_string(),
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(5),
            policy: ReconnectionPolicy::default(),
            reconnect_close_codes: vec![1005, 1006],
            keepalive_interval: None,
        }
    }
}

pub struct JsonWireAdapter {
    config: JsonAdapterConfig,
    token_provider: Option<Arc<dyn TokenProvider>>,
    token: RwLock<Option<String>>,
}

impl JsonWireAdapter {
    pub fn new(config: JsonAdapterConfig) -> Self {
        Self {
            config,
            token_provider: None,
            token: RwLock::new(None),
        }
    }

    /// Make this a private stream authenticated with tokens from `provider`.
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    pub fn config(&self) -> &JsonAdapterConfig {
        &self.config
    }

    /// Current session token, if one has been acquired.
    pub fn current_token(&self) -> Option<String> {
        self.token.read().clone()
    }

    fn uses_url_token(&self) -> bool {
        self.config.url.contains(TOKEN_PLACEHOLDER)
    }

    async fn ensure_token(&self) -> WsResult<String> {
        if let Some(token) = self.current_token() {
            return Ok(token);
        }
        let provider = self
            .token_provider
            .as_ref()
            .ok_or_else(|| WsError::Authentication("no token provider".to_string()))?;
        let token = provider.acquire().await?;
        info!(venue = %self.config.venue, "Session token acquired");
        *self.token.write() = Some(token.clone());
        Ok(token)
    }

    fn build_url(&self, token: Option<&str>) -> String {
        match token {
            Some(token) if self.uses_url_token() => {
                self.config.url.replace(TOKEN_PLACEHOLDER, token)
            }
            _ => self.config.url.clone(),
        }
    }
}

#[async_trait]
impl WireAdapter for JsonWireAdapter {
    fn venue(&self) -> &str {
        &self.config.venue
    }

    async fn connect(&self) -> WsResult<WsStream> {
        let token = if self.requires_auth() {
            Some(self.ensure_token().await?)
        } else {
            None
        };
        let url = self.build_url(token.as_deref());
        debug!(venue = %self.config.venue, url = %self.config.url, "Opening transport");

        // TCP_NODELAY for lower latency
        let connect = connect_async_tls_with_config(url.as_str(), None, true, None);
        let (stream, _response) = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| WsError::Timeout("connect".to_string()))??;
        Ok(stream)
    }

    fn requires_auth(&self) -> bool {
        self.token_provider.is_some()
    }

    async fn authenticate(&self, stream: &mut WsStream) -> WsResult<bool> {
        if self.uses_url_token() {
            // The token in the URL already authenticated the session.
            return Ok(true);
        }
        let token = self.ensure_token().await?;
        let frame = json!({ "op": "auth", "token": token }).to_string();
        stream.send(Message::Text(frame)).await?;

        let reply = async {
            while let Some(msg) = stream.next().await {
                let text = match msg.map_err(WsError::from)? {
                    Message::Text(text) => text,
                    Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Message::Close(_) => break,
                    _ => continue,
                };
                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                if value.get("event").and_then(Value::as_str) == Some("auth") {
                    return Ok(value
                        .get("success")
                        .and_then(Value::as_bool)
                        .unwrap_or(false));
                }
                debug!(venue = %self.config.venue, "Ignoring frame while waiting for auth reply");
            }
            Err::<bool, WsError>(WsError::ConnectionClosed {
                code: 1006,
                reason: "closed during auth".to_string(),
            })
        };

        tokio::time::timeout(self.config.auth_timeout, reply)
            .await
            .map_err(|_| WsError::Timeout("auth reply".to_string()))?
    }

    fn get_reconnection_policy(&self) -> ReconnectionPolicy {
        self.config.policy.clone()
    }

    fn classify(&self, error: &WsError) -> ErrorKind {
        match error {
            WsError::ConnectionClosed { code, .. }
                if self.config.reconnect_close_codes.contains(code) =>
            {
                ErrorKind::AbnormalClosure
            }
            _ => error.kind(),
        }
    }

    fn handle_heartbeat(&self) -> Option<WireMessage> {
        Some(WireMessage::Text(json!({ "op": "ping" }).to_string()))
    }

    fn encode_subscription(
        &self,
        action: SubscriptionAction,
        entry: &SubscriptionEntry,
    ) -> WsResult<Vec<WireMessage>> {
        let op = match action {
            SubscriptionAction::Subscribe => "subscribe",
            SubscriptionAction::Unsubscribe => "unsubscribe",
        };
        let mut frame = json!({ "op": op, "channel": entry.channel.as_str() });
        if let Some(symbol) = &entry.symbol {
            frame["symbol"] = Value::String(symbol.clone());
        }
        Ok(vec![WireMessage::Text(serde_json::to_string(&frame)?)])
    }

    fn decode(&self, frame: RawFrame) -> ParsedMessage {
        let text = match frame {
            RawFrame::Text(text) => text,
            RawFrame::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => return ParsedMessage::protocol_error("binary frame is not UTF-8", None),
            },
        };
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => decode_value(value, &text),
            Err(e) => ParsedMessage::protocol_error(format!("invalid JSON: {e}"), Some(&text)),
        }
    }

    fn keepalive_interval(&self) -> Option<Duration> {
        self.token_provider
            .as_ref()
            .and(self.config.keepalive_interval)
    }

    async fn refresh_token(&self) -> WsResult<()> {
        let Some(provider) = &self.token_provider else {
            return Ok(());
        };
        let token = self
            .current_token()
            .ok_or_else(|| WsError::Authentication("no token to refresh".to_string()))?;
        provider.refresh(&token).await
    }

    async fn regenerate_token(&self) -> WsResult<()> {
        let Some(provider) = &self.token_provider else {
            return Ok(());
        };
        let token = provider.acquire().await?;
        *self.token.write() = Some(token);
        warn!(venue = %self.config.venue, "Session token regenerated");
        Ok(())
    }
}

fn decode_value(value: Value, raw: &str) -> ParsedMessage {
    if let Some(event) = value.get("event").and_then(Value::as_str) {
        return match event {
            "pong" | "heartbeat" => ParsedMessage::Heartbeat,
            "subscribed" => decode_ack(&value, SubscriptionAction::Subscribe, raw),
            "unsubscribed" => decode_ack(&value, SubscriptionAction::Unsubscribe, raw),
            "error" => {
                let message = value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified");
                ParsedMessage::protocol_error(format!("venue error: {message}"), Some(raw))
            }
            other => ParsedMessage::protocol_error(format!("unknown event: {other}"), Some(raw)),
        };
    }

    if let Some(op) = value.get("op").and_then(Value::as_str) {
        return match op {
            "subscribe" => decode_ack(&value, SubscriptionAction::Subscribe, raw),
            "unsubscribe" => decode_ack(&value, SubscriptionAction::Unsubscribe, raw),
            "ping" | "pong" => ParsedMessage::Heartbeat,
            other => ParsedMessage::protocol_error(format!("unknown op: {other}"), Some(raw)),
        };
    }

    let (channel_key, symbol) = match channel_and_symbol(&value) {
        Ok(parts) => parts,
        Err(reason) => return ParsedMessage::protocol_error(reason, Some(raw)),
    };
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return ParsedMessage::protocol_error("missing type", Some(raw));
    };
    let data = value.get("data").cloned().unwrap_or(Value::Null);

    let decoded = match kind {
        "order_book" => serde_json::from_value(data).map(|payload| ParsedMessage::OrderBookUpdate {
            channel_key,
            symbol,
            payload,
        }),
        "trade" => serde_json::from_value(data).map(|payload| ParsedMessage::TradeEvent {
            channel_key,
            symbol,
            payload,
        }),
        "order" => serde_json::from_value(data).map(|payload| ParsedMessage::OrderUpdate {
            channel_key,
            symbol,
            payload,
        }),
        "balance" => serde_json::from_value(data).map(|payload| ParsedMessage::BalanceUpdate {
            channel_key,
            symbol,
            payload,
        }),
        other => {
            return ParsedMessage::protocol_error(format!("unknown type: {other}"), Some(raw))
        }
    };

    decoded.unwrap_or_else(|e| {
        ParsedMessage::protocol_error(format!("invalid {kind} payload: {e}"), Some(raw))
    })
}

fn decode_ack(value: &Value, action: SubscriptionAction, raw: &str) -> ParsedMessage {
    match channel_and_symbol(value) {
        Ok((channel_key, symbol)) => ParsedMessage::SubscriptionAck {
            channel_key,
            symbol,
            action,
        },
        Err(reason) => ParsedMessage::protocol_error(reason, Some(raw)),
    }
}

fn channel_and_symbol(value: &Value) -> Result<(ChannelKey, Option<String>), String> {
    let channel = value
        .get("channel")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing channel".to_string())?;
    let channel_key = ChannelKey::new(channel).map_err(|e| e.to_string())?;
    let symbol = value
        .get("symbol")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok((channel_key, symbol))
}
