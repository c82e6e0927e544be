//! Core vocabulary for the xarb exchange connectivity layer.
//!
//! Shared by the stream side (`xarb-ws`) and the REST side (`xarb-rest`):
//! - `ChannelKey`, `SubscriptionEntry`: what a stream is subscribed to
//! - `ParsedMessage`: normalized events decoded from venue frames
//! - `ErrorKind`: the classification vocabulary both sides agree on
//! - `ReconnectionPolicy`: pure backoff computation
//! - `Price`, `Size`: precision-safe numeric types

pub mod channel;
pub mod decimal;
pub mod error;
pub mod error_kind;
pub mod message;
pub mod policy;

pub use channel::{ChannelKey, SubscriptionAction, SubscriptionEntry};
pub use decimal::{Price, Size};
pub use error::{CoreError, Result};
pub use error_kind::ErrorKind;
pub use message::{
    BalanceUpdate, OrderBookUpdate, OrderStatus, OrderUpdate, ParsedMessage, PriceLevel, Side,
    TradeEvent,
};
pub use policy::ReconnectionPolicy;
