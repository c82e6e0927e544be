//! Error classification shared by stream and REST paths.
//!
//! Wire adapters classify transport failures into these kinds, and the REST
//! client classifies HTTP outcomes into the same set, so reconnect and retry
//! decisions read from one vocabulary.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Socket closed without a proper close handshake (1005/1006 and friends).
    AbnormalClosure,
    /// No response or liveness signal within the deadline.
    Timeout,
    /// TCP/TLS connect failed or the peer refused the connection.
    ConnectionRefused,
    /// Established connection failed mid-flight (reset, broken pipe).
    ConnectionError,
    /// Credentials rejected or token expired beyond recovery.
    AuthFailure,
    /// Venue throttled the request (HTTP 429/418).
    RateLimit,
    /// Request rejected as invalid (HTTP 4xx other than auth/rate limit).
    Validation,
    /// Venue-side failure (HTTP 5xx).
    Server,
    /// Frame could not be decoded.
    Protocol,
    Unknown,
}

impl ErrorKind {
    /// Classify an HTTP status code.
    ///
    /// Returns `None` for success and informational codes.
    pub fn from_http_status(status: u16) -> Option<Self> {
        match status {
            429 | 418 => Some(Self::RateLimit),
            401 | 403 => Some(Self::AuthFailure),
            408 => Some(Self::Timeout),
            400..=499 => Some(Self::Validation),
            500..=599 => Some(Self::Server),
            _ => None,
        }
    }

    /// Classify a WebSocket close code.
    pub fn from_close_code(code: u16) -> Self {
        match code {
            // 1005: no status received, 1006: abnormal closure,
            // 1001: going away (server restart), 1012: service restart
            1001 | 1005 | 1006 | 1012 | 1013 => Self::AbnormalClosure,
            1008 | 4001 | 4003 => Self::AuthFailure,
            1011 => Self::Server,
            _ => Self::Unknown,
        }
    }

    /// Whether the failure is transient on a REST call.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimit
                | Self::ConnectionError
                | Self::ConnectionRefused
                | Self::Timeout
                | Self::Server
                | Self::AbnormalClosure
        )
    }

    /// Whether the failure warrants a fresh connection on a stream.
    ///
    /// Auth failures are fatal: reconnecting with the same credentials
    /// would fail the same way.
    pub fn is_reconnectable(&self) -> bool {
        !matches!(self, Self::AuthFailure | Self::Validation)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AbnormalClosure => "abnormal_closure",
            Self::Timeout => "timeout",
            Self::ConnectionRefused => "connection_refused",
            Self::ConnectionError => "connection_error",
            Self::AuthFailure => "auth_failure",
            Self::RateLimit => "rate_limit",
            Self::Validation => "validation",
            Self::Server => "server",
            Self::Protocol => "protocol",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_classification() {
        assert_eq!(ErrorKind::from_http_status(200), None);
        assert_eq!(ErrorKind::from_http_status(429), Some(ErrorKind::RateLimit));
        assert_eq!(ErrorKind::from_http_status(418), Some(ErrorKind::RateLimit));
        assert_eq!(ErrorKind::from_http_status(401), Some(ErrorKind::AuthFailure));
        assert_eq!(ErrorKind::from_http_status(400), Some(ErrorKind::Validation));
        assert_eq!(ErrorKind::from_http_status(503), Some(ErrorKind::Server));
    }

    #[test]
    fn test_close_code_classification() {
        assert_eq!(ErrorKind::from_close_code(1005), ErrorKind::AbnormalClosure);
        assert_eq!(ErrorKind::from_close_code(1006), ErrorKind::AbnormalClosure);
        assert_eq!(ErrorKind::from_close_code(1008), ErrorKind::AuthFailure);
        assert_eq!(ErrorKind::from_close_code(1000), ErrorKind::Unknown);
    }

    #[test]
    fn test_auth_failure_is_terminal() {
        assert!(!ErrorKind::AuthFailure.is_reconnectable());
        assert!(!ErrorKind::AuthFailure.is_transient());
        assert!(ErrorKind::AbnormalClosure.is_reconnectable());
        assert!(ErrorKind::Server.is_transient());
        assert!(!ErrorKind::Validation.is_transient());
    }
}
