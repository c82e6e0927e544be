//! Request signing.
//!
//! Venues authenticate REST calls differently (API key headers, HMAC over
//! the query). The client signs each attempt right before sending, so a
//! signature timestamp is always fresh on retries.

use crate::error::{RestError, RestResult};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Request;
use std::fmt;
use zeroize::Zeroizing;

pub trait RequestSigner: Send + Sync {
    fn sign(&self, request: Request) -> RestResult<Request>;
}

/// Public endpoints: leaves requests untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSigner;

impl RequestSigner for NoSigner {
    fn sign(&self, request: Request) -> RestResult<Request> {
        Ok(request)
    }
}

/// Sends an API key in a fixed header.
pub struct ApiKeySigner {
    header: HeaderName,
    api_key: Zeroizing<String>,
}

impl ApiKeySigner {
    pub fn new(header: &str, api_key: impl Into<String>) -> RestResult<Self> {
        let header = HeaderName::from_bytes(header.as_bytes())
            .map_err(|e| RestError::InvalidRequest(format!("invalid header name {header}: {e}")))?;
        Ok(Self {
            header,
            api_key: Zeroizing::new(api_key.into()),
        })
    }

    /// Read the key from an environment variable.
    pub fn from_env(header: &str, var_name: &str) -> RestResult<Self> {
        let key = std::env::var(var_name)
            .map_err(|_| RestError::InvalidRequest(format!("environment variable {var_name} not set")))?;
        Self::new(header, key)
    }
}

impl fmt::Debug for ApiKeySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeySigner")
            .field("header", &self.header)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl RequestSigner for ApiKeySigner {
    fn sign(&self, mut request: Request) -> RestResult<Request> {
        let mut value = HeaderValue::from_str(&self.api_key)
            .map_err(|_| RestError::InvalidRequest("API key is not a valid header value".to_string()))?;
        value.set_sensitive(true);
        request.headers_mut().insert(self.header.clone(), value);
        Ok(request)
    }
}
