//! Normalized stream events.
//!
//! Wire adapters decode venue frames into `ParsedMessage`; consumers only
//! ever see these types.

use crate::channel::{ChannelKey, SubscriptionAction};
use crate::decimal::{Price, Size};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Trade or order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// One price level of an order book side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Price,
    pub size: Size,
}

/// Order book delta or snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookUpdate {
    #[serde(default)]
    pub bids: Vec<PriceLevel>,
    #[serde(default)]
    pub asks: Vec<PriceLevel>,
    /// Venue sequence number, if the venue provides one.
    #[serde(default)]
    pub sequence: Option<u64>,
    #[serde(default)]
    pub is_snapshot: bool,
}

/// Public trade print.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub trade_id: String,
    pub price: Price,
    pub size: Size,
    pub side: Side,
    /// Venue timestamp in milliseconds.
    pub timestamp_ms: u64,
}

/// Order lifecycle status as reported by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired
        )
    }
}

/// Private order update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: String,
    #[serde(default)]
    pub client_order_id: Option<String>,
    pub status: OrderStatus,
    pub side: Side,
    pub price: Price,
    pub size: Size,
    #[serde(default = "zero_size")]
    pub filled_size: Size,
}

fn zero_size() -> Size {
    Size::ZERO
}

/// Private balance change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceUpdate {
    pub asset: String,
    pub free: Size,
    #[serde(default = "zero_size")]
    pub locked: Size,
}

/// A decoded stream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedMessage {
    OrderBookUpdate {
        channel_key: ChannelKey,
        symbol: Option<String>,
        payload: OrderBookUpdate,
    },
    TradeEvent {
        channel_key: ChannelKey,
        symbol: Option<String>,
        payload: TradeEvent,
    },
    OrderUpdate {
        channel_key: ChannelKey,
        symbol: Option<String>,
        payload: OrderUpdate,
    },
    BalanceUpdate {
        channel_key: ChannelKey,
        symbol: Option<String>,
        payload: BalanceUpdate,
    },
    /// Application-level liveness signal (pong, server ping, heartbeat event).
    Heartbeat,
    /// Venue confirmation of a subscribe/unsubscribe request.
    SubscriptionAck {
        channel_key: ChannelKey,
        symbol: Option<String>,
        action: SubscriptionAction,
    },
    /// Frame that could not be decoded. Dropped after logging.
    ProtocolError { reason: String, raw: Option<String> },
}

impl ParsedMessage {
    /// Build a protocol error, keeping a bounded preview of the raw frame.
    pub fn protocol_error(reason: impl Into<String>, raw: Option<&str>) -> Self {
        const PREVIEW_LEN: usize = 256;
        let raw = raw.map(|r| {
            if r.len() <= PREVIEW_LEN {
                r.to_string()
            } else {
                let mut end = PREVIEW_LEN;
                while !r.is_char_boundary(end) {
                    end -= 1;
                }
                format!("{}...", &r[..end])
            }
        });
        Self::ProtocolError {
            reason: reason.into(),
            raw,
        }
    }

    /// Channel key for data-bearing variants and acks.
    pub fn channel_key(&self) -> Option<&ChannelKey> {
        match self {
            Self::OrderBookUpdate { channel_key, .. }
            | Self::TradeEvent { channel_key, .. }
            | Self::OrderUpdate { channel_key, .. }
            | Self::BalanceUpdate { channel_key, .. }
            | Self::SubscriptionAck { channel_key, .. } => Some(channel_key),
            Self::Heartbeat | Self::ProtocolError { .. } => None,
        }
    }

    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::OrderBookUpdate { symbol, .. }
            | Self::TradeEvent { symbol, .. }
            | Self::OrderUpdate { symbol, .. }
            | Self::BalanceUpdate { symbol, .. }
            | Self::SubscriptionAck { symbol, .. } => symbol.as_deref(),
            Self::Heartbeat | Self::ProtocolError { .. } => None,
        }
    }

    /// Whether this message must be routed to a consumer handler.
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            Self::OrderBookUpdate { .. }
                | Self::TradeEvent { .. }
                | Self::OrderUpdate { .. }
                | Self::BalanceUpdate { .. }
        )
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OrderBookUpdate { .. } => "order_book",
            Self::TradeEvent { .. } => "trade",
            Self::OrderUpdate { .. } => "order",
            Self::BalanceUpdate { .. } => "balance",
            Self::Heartbeat => "heartbeat",
            Self::SubscriptionAck { .. } => "ack",
            Self::ProtocolError { .. } => "protocol_error",
        }
    }
}
