//! Channel and subscription identifiers.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Venue-neutral channel name (e.g., "depth", "trade", "orders").
///
/// Handlers are bound per channel key, and the wire adapter translates the
/// key into the venue's own stream name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelKey(String);

impl ChannelKey {
    /// Create a channel key. Empty or whitespace-containing keys are rejected.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() || key.chars().any(char::is_whitespace) {
            return Err(CoreError::InvalidChannelKey(key));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ChannelKey {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for ChannelKey {
    type Error = CoreError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ChannelKey> for String {
    fn from(key: ChannelKey) -> Self {
        key.0
    }
}

/// One desired subscription: a channel, optionally scoped to a symbol.
///
/// Account channels (orders, balances) usually carry no symbol.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionEntry {
    pub channel: ChannelKey,
    #[serde(default)]
    pub symbol: Option<String>,
}

impl SubscriptionEntry {
    pub fn new(channel: ChannelKey, symbol: Option<String>) -> Self {
        Self { channel, symbol }
    }

    /// Symbol-scoped entry.
    pub fn symbol(channel: ChannelKey, symbol: impl Into<String>) -> Self {
        Self::new(channel, Some(symbol.into()))
    }

    /// Channel-wide entry.
    pub fn channel(channel: ChannelKey) -> Self {
        Self::new(channel, None)
    }
}

impl fmt::Display for SubscriptionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.symbol {
            Some(symbol) => write!(f, "{}:{}", self.channel, symbol),
            None => write!(f, "{}", self.channel),
        }
    }
}

/// Direction of a subscription wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

impl fmt::Display for SubscriptionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscribe => write!(f, "SUBSCRIBE"),
            Self::Unsubscribe => write!(f, "UNSUBSCRIBE"),
        }
    }
}
