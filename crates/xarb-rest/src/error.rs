//! REST error types.

use std::time::Duration;
use thiserror::Error;
use xarb_core::ErrorKind;

#[derive(Debug, Clone, Error)]
pub enum RestError {
    #[error("Rate limited: HTTP {status}")]
    RateLimited {
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error("Request rejected: HTTP {status}: {body}")]
    Validation { status: u16, body: String },

    #[error("Authentication failed: HTTP {status}")]
    Authentication { status: u16 },

    #[error("Server error: HTTP {status}: {body}")]
    Server {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<RestError>,
        history: Vec<RestError>,
    },

    #[error("HTTP client error: {0}")]
    HttpClient(String),
}

impl RestError {
    /// Build the error for a non-success HTTP response.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match ErrorKind::from_http_status(status) {
            Some(ErrorKind::RateLimit) => Self::RateLimited {
                status,
                retry_after,
            },
            Some(ErrorKind::AuthFailure) => Self::Authentication { status },
            Some(ErrorKind::Timeout) => Self::Timeout(format!("HTTP {status}")),
            Some(ErrorKind::Server) => Self::Server {
                status,
                body,
                retry_after,
            },
            _ => Self::Validation { status, body },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited { .. } => ErrorKind::RateLimit,
            Self::Validation { .. } | Self::InvalidRequest(_) => ErrorKind::Validation,
            Self::Authentication { .. } => ErrorKind::AuthFailure,
            Self::Server { .. } => ErrorKind::Server,
            Self::Connection(_) => ErrorKind::ConnectionError,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Decode(_) => ErrorKind::Protocol,
            Self::RetriesExhausted { last, .. } => last.kind(),
            Self::HttpClient(_) => ErrorKind::Unknown,
        }
    }

    /// Venue-provided wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } | Self::Server { retry_after, .. } => {
                *retry_after
            }
            _ => None,
        }
    }

    /// HTTP status, when the venue answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { status, .. }
            | Self::Validation { status, .. }
            | Self::Authentication { status }
            | Self::Server { status, .. } => Some(*status),
            Self::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for RestError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_connect() {
            Self::Connection(e.to_string())
        } else if e.is_decode() || e.is_body() {
            Self::Decode(e.to_string())
        } else if e.is_builder() {
            Self::InvalidRequest(e.to_string())
        } else {
            Self::Connection(e.to_string())
        }
    }
}

pub type RestResult<T> = Result<T, RestError>;
