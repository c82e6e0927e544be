//! WebSocket error types.

use thiserror::Error;
use tokio_tungstenite::tungstenite;
use xarb_core::{ChannelKey, ErrorKind};

#[derive(Debug, Error)]
pub enum WsError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed: code={code}, reason={reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Heartbeat timeout")]
    HeartbeatTimeout,

    #[error("Session token rotated: {0}")]
    TokenRotated(String),

    #[error("Max reconnection attempts reached: {attempts} (last error: {last})")]
    MaxReconnectAttempts { attempts: u32, last: String },

    #[error("No handler bound for channel {0}")]
    UnboundChannel(ChannelKey),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Connection manager already started")]
    AlreadyStarted,

    #[error("Connection manager closed")]
    Closed,

    #[error("Stream task failed: {0}")]
    TaskFailed(String),

    #[error("Tungstenite error: {0}")]
    Tungstenite(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WsError {
    /// Default classification into the shared error vocabulary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::ConnectionError,
            Self::ConnectionClosed { code, .. } => ErrorKind::from_close_code(*code),
            Self::Timeout(_) | Self::HeartbeatTimeout => ErrorKind::Timeout,
            Self::SendFailed(_) => ErrorKind::ConnectionError,
            Self::Protocol(_) | Self::Json(_) => ErrorKind::Protocol,
            Self::Authentication(_) => ErrorKind::AuthFailure,
            Self::Subscription(_) | Self::UnboundChannel(_) => ErrorKind::Validation,
            Self::Tungstenite(e) => classify_tungstenite(e),
            Self::TokenRotated(_)
            | Self::MaxReconnectAttempts { .. }
            | Self::AlreadyStarted
            | Self::Closed
            | Self::TaskFailed(_) => ErrorKind::Unknown,
        }
    }

    /// Errors that end a stream no matter how they are classified.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::MaxReconnectAttempts { .. }
                | Self::UnboundChannel(_)
                | Self::AlreadyStarted
                | Self::Closed
                | Self::TaskFailed(_)
        )
    }
}

fn classify_tungstenite(error: &tungstenite::Error) -> ErrorKind {
    use std::io::ErrorKind as IoKind;
    use tungstenite::error::ProtocolError;
    use tungstenite::Error;

    match error {
        Error::ConnectionClosed | Error::AlreadyClosed => ErrorKind::AbnormalClosure,
        Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            ErrorKind::AbnormalClosure
        }
        Error::Io(io) => match io.kind() {
            IoKind::ConnectionRefused | IoKind::NotFound | IoKind::AddrNotAvailable => {
                ErrorKind::ConnectionRefused
            }
            IoKind::TimedOut | IoKind::WouldBlock => ErrorKind::Timeout,
            IoKind::ConnectionReset | IoKind::ConnectionAborted | IoKind::BrokenPipe => {
                ErrorKind::AbnormalClosure
            }
            _ => ErrorKind::ConnectionError,
        },
        Error::Tls(_) | Error::Url(_) => ErrorKind::ConnectionRefused,
        Error::Http(response) => {
            ErrorKind::from_http_status(response.status().as_u16()).unwrap_or(ErrorKind::Unknown)
        }
        Error::Protocol(_) | Error::Utf8 | Error::Capacity(_) => ErrorKind::Protocol,
        _ => ErrorKind::Unknown,
    }
}

pub type WsResult<T> = Result<T, WsError>;
