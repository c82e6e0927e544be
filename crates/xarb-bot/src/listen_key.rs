//! Listen-key token provider for private streams.
//!
//! POST creates a key, PUT extends it. Both calls are idempotent on the
//! venue side (a second POST returns the live key), so they go through the
//! REST retry path as safe requests.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};
use xarb_core::ErrorKind;
use xarb_rest::{Idempotency, RestClient, RestError};
use xarb_ws::{TokenProvider, WsError, WsResult};

pub struct ListenKeyProvider {
    rest: Arc<RestClient>,
    endpoint: String,
}

impl ListenKeyProvider {
    pub fn new(rest: Arc<RestClient>, endpoint: impl Into<String>) -> Self {
        Self {
            rest,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TokenProvider for ListenKeyProvider {
    async fn acquire(&self) -> WsResult<String> {
        let response = self
            .rest
            .request_with(Method::POST, &self.endpoint, Value::Null, Idempotency::Safe)
            .await
            .map_err(to_ws_error)?;

        let key = response
            .body
            .get("listenKey")
            .and_then(Value::as_str)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| WsError::Protocol("listen key response without listenKey".to_string()))?;
        info!(endpoint = %self.endpoint, "Listen key acquired");
        Ok(key.to_string())
    }

    async fn refresh(&self, token: &str) -> WsResult<()> {
        self.rest
            .request_with(
                Method::PUT,
                &self.endpoint,
                json!({ "listenKey": token }),
                Idempotency::Safe,
            )
            .await
            .map_err(to_ws_error)?;
        debug!(endpoint = %self.endpoint, "Listen key extended");
        Ok(())
    }
}

fn to_ws_error(error: RestError) -> WsError {
    match error.kind() {
        ErrorKind::AuthFailure | ErrorKind::Validation => WsError::Authentication(error.to_string()),
        ErrorKind::Timeout => WsError::Timeout(error.to_string()),
        _ => WsError::Transport(error.to_string()),
    }
}
