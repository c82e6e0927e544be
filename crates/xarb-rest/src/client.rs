//! HTTP client for venue REST APIs.
//!
//! Every attempt takes its own rate-limit permit, gets its own timeout and
//! is signed afresh. Retries follow `RetryExecutor`; mutating calls only
//! retry when they carry an idempotency key.

use crate::error::{RestError, RestResult};
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::retry::{Idempotency, RetryConfig, RetryExecutor};
use crate::signer::{NoSigner, RequestSigner};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Method};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use xarb_telemetry::Metrics;

/// Default timeout for API requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Wait applied when a weight-usage header reports the limit is spent.
const WEIGHT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: String,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Header carrying the idempotency key on mutating calls.
    pub idempotency_header: String,
    /// Venue header reporting consumed request weight, with its limit.
    pub weight_header: Option<(String, u32)>,
    pub retry: RetryConfig,
    pub limiter: RateLimiterConfig,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: DEFAULT_TIMEOUT,
            idempotency_header: "X-Idempotency-Key".to_string(),
            weight_header: None,
            retry: RetryConfig::default(),
            limiter: RateLimiterConfig::default(),
        }
    }
}

/// Successful response.
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: u16,
    /// Parsed JSON body (`Null` when empty).
    pub body: Value,
    /// Attempts it took.
    pub attempts: u32,
}

pub struct RestClient {
    http: Client,
    config: RestConfig,
    limiter: RateLimiter,
    retry: RetryExecutor,
    signer: Arc<dyn RequestSigner>,
}

impl RestClient {
    pub fn new(config: RestConfig) -> RestResult<Self> {
        Self::with_signer(config, Arc::new(NoSigner))
    }

    pub fn with_signer(config: RestConfig, signer: Arc<dyn RequestSigner>) -> RestResult<Self> {
        let http = Client::builder()
            .build()
            .map_err(|e| RestError::HttpClient(format!("Failed to create HTTP client: {e}")))?;
        let limiter = RateLimiter::new(config.limiter.clone())?;
        let retry = RetryExecutor::new(config.retry.clone());

        info!(base_url = %config.base_url, max_in_flight = limiter.max_in_flight(), "REST client ready");
        Ok(Self {
            http,
            config,
            limiter,
            retry,
            signer,
        })
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn config(&self) -> &RestConfig {
        &self.config
    }

    /// Fresh key for `post_order`.
    pub fn new_idempotency_key() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Send a request with the default idempotency for `method`.
    ///
    /// GET and HEAD are safe to retry. Anything else counts as mutating
    /// without a key and gets a single attempt.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: Value,
    ) -> RestResult<RestResponse> {
        let idempotency = if method == Method::GET || method == Method::HEAD {
            Idempotency::Safe
        } else {
            Idempotency::Mutating { key: None }
        };
        self.request_with(method, endpoint, params, idempotency).await
    }

    /// Send a request with explicit idempotency.
    pub async fn request_with(
        &self,
        method: Method,
        endpoint: &str,
        params: Value,
        idempotency: Idempotency,
    ) -> RestResult<RestResponse> {
        let result = self
            .retry
            .execute(endpoint, &idempotency, |attempt| {
                self.send_once(method.clone(), endpoint, &params, idempotency.key(), attempt)
            })
            .await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind().as_str(),
        };
        Metrics::rest_request(self.limiter.pattern_for(endpoint), outcome);
        result
    }

    /// Submit an order under `idempotency_key`.
    ///
    /// The key goes out in the idempotency header and, unless the caller set
    /// one, as `client_order_id`, so a retried submission is deduplicated.
    pub async fn post_order(
        &self,
        endpoint: &str,
        mut params: Value,
        idempotency_key: impl Into<String>,
    ) -> RestResult<RestResponse> {
        let key = idempotency_key.into();
        if key.is_empty() {
            return Err(RestError::InvalidRequest(
                "idempotency key must not be empty".to_string(),
            ));
        }
        if params.is_null() {
            params = Value::Object(serde_json::Map::new());
        }
        let Value::Object(map) = &mut params else {
            return Err(RestError::InvalidRequest(
                "order params must be a JSON object".to_string(),
            ));
        };
        map.entry("client_order_id")
            .or_insert_with(|| Value::String(key.clone()));
        self.request_with(Method::POST, endpoint, params, Idempotency::mutating(key))
            .await
    }

    async fn send_once(
        &self,
        method: Method,
        endpoint: &str,
        params: &Value,
        idempotency_key: Option<&str>,
        attempt: u32,
    ) -> RestResult<RestResponse> {
        let permit = self
            .limiter
            .acquire(endpoint, self.limiter.weight_for(endpoint))
            .await?;

        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint);
        let mut builder = self
            .http
            .request(method.clone(), &url)
            .timeout(self.config.timeout);

        if !params.is_null() {
            builder = if method == Method::GET || method == Method::DELETE || method == Method::HEAD
            {
                builder.query(params)
            } else {
                builder.json(params)
            };
        }
        if let Some(key) = idempotency_key {
            builder = builder.header(self.config.idempotency_header.as_str(), key);
        }

        let request = self.signer.sign(builder.build()?)?;
        debug!(%method, endpoint, attempt, "Sending request");
        let response = self.http.execute(request).await?;

        let status = response.status().as_u16();
        let retry_after = self.retry_after(response.headers());
        let text = response.text().await?;
        permit.release();

        if !(200..300).contains(&status) {
            debug!(%method, endpoint, attempt, status, "Request failed");
            return Err(RestError::from_status(status, text, retry_after));
        }

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| RestError::Decode(e.to_string()))?
        };
        Ok(RestResponse {
            status,
            body,
            attempts: attempt,
        })
    }

    /// Venue wait hint: `Retry-After` seconds, or the weight window when the
    /// weight header reports the limit is spent.
    fn retry_after(&self, headers: &HeaderMap) -> Option<Duration> {
        let header_u64 = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
        };

        if let Some(secs) = header_u64(RETRY_AFTER.as_str()) {
            return Some(Duration::from_secs(secs));
        }
        let (name, limit) = self.config.weight_header.as_ref()?;
        let used = header_u64(name)?;
        (used >= u64::from(*limit)).then_some(WEIGHT_WINDOW)
    }
}
