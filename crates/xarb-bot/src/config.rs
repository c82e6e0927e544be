//! Application configuration.

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use xarb_core::{ChannelKey, ReconnectionPolicy, SubscriptionEntry};
use xarb_rest::{BucketConfig, RateLimiterConfig, RestConfig, RetryConfig};
use xarb_ws::{ConnectionConfig, JsonAdapterConfig};

/// Environment overlay prefix, e.g. `XARB__REST__BASE_URL`.
const ENV_PREFIX: &str = "XARB";

/// Public market data or private account stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    #[default]
    Public,
    /// Needs a listen key (see `[auth]`).
    Private,
}

/// One `subscriptions = [{channel, symbol}]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub channel: String,
    #[serde(default)]
    pub symbol: Option<String>,
}

/// `[[streams]]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    /// Stream URL. Private streams may embed `{token}` for the listen key.
    pub url: String,
    #[serde(default)]
    pub kind: StreamKind,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    /// 0 = unlimited.
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Close codes treated as abnormal closures (always reconnect).
    #[serde(default = "default_reconnect_close_codes")]
    pub reconnect_close_codes: Vec<u16>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
    /// Channels the venue pushes without a subscription (order and balance
    /// updates on private streams). They still need a handler.
    #[serde(default)]
    pub channels: Vec<String>,
}

fn default_ping_interval_ms() -> u64 {
    30_000
}

fn default_ping_timeout_ms() -> u64 {
    10_000
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_reconnect_close_codes() -> Vec<u16> {
    vec![1005, 1006]
}

impl StreamConfig {
    pub fn reconnection_policy(&self) -> ReconnectionPolicy {
        ReconnectionPolicy::new(
            self.max_reconnect_attempts,
            Duration::from_millis(self.initial_delay_ms),
            self.backoff_factor,
            Duration::from_millis(self.max_delay_ms),
        )
    }

    pub fn connection_config(&self, auth: &AuthConfig) -> ConnectionConfig {
        ConnectionConfig {
            name: self.name.clone(),
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            ping_timeout: Duration::from_millis(self.ping_timeout_ms),
            max_token_regenerate_attempts: auth.max_regenerate_attempts,
            ..Default::default()
        }
    }

    pub fn adapter_config(&self, auth: &AuthConfig) -> JsonAdapterConfig {
        JsonAdapterConfig {
            url: self.url.clone(),
            venue: self.name.clone(),
            policy: self.reconnection_policy(),
            reconnect_close_codes: self.reconnect_close_codes.clone(),
            keepalive_interval: (self.kind == StreamKind::Private)
                .then(|| Duration::from_millis(auth.keepalive_interval_ms)),
            ..Default::default()
        }
    }

    /// Initial subscription set.
    pub fn subscription_entries(&self) -> AppResult<Vec<SubscriptionEntry>> {
        self.subscriptions
            .iter()
            .map(|s| -> AppResult<SubscriptionEntry> {
                Ok(SubscriptionEntry::new(ChannelKey::new(&s.channel)?, s.symbol.clone()))
            })
            .collect()
    }

    /// Every channel that needs a handler, sorted and deduplicated.
    pub fn bound_channels(&self) -> AppResult<Vec<ChannelKey>> {
        let names: BTreeSet<&str> = self
            .subscriptions
            .iter()
            .map(|s| s.channel.as_str())
            .chain(self.channels.iter().map(String::as_str))
            .collect();
        names
            .into_iter()
            .map(|name| -> AppResult<ChannelKey> { Ok(ChannelKey::new(name)?) })
            .collect()
    }
}

/// `[[rest.endpoints]]` and `[rest.default_bucket]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Exact path or `prefix*`.
    pub pattern: String,
    pub requests_per_second: f64,
    pub burst_capacity: u32,
    #[serde(default)]
    pub min_interval_ms: u64,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl EndpointConfig {
    pub fn to_bucket(&self) -> BucketConfig {
        BucketConfig::new(&self.pattern, self.burst_capacity, self.requests_per_second)
            .with_min_interval(Duration::from_millis(self.min_interval_ms))
            .with_weight(self.weight)
    }
}

fn default_bucket() -> EndpointConfig {
    EndpointConfig {
        pattern: "*".to_string(),
        requests_per_second: 5.0,
        burst_capacity: 5,
        min_interval_ms: 0,
        weight: 1,
    }
}

/// `[rest.retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

/// `[rest]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestSettings {
    pub base_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_idempotency_header")]
    pub idempotency_header: String,
    /// Venue header reporting consumed request weight.
    #[serde(default)]
    pub used_weight_header: Option<String>,
    #[serde(default = "default_weight_limit")]
    pub weight_limit: u32,
    /// Header carrying the API key, when the venue wants one.
    #[serde(default)]
    pub api_key_header: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default = "default_bucket")]
    pub default_bucket: EndpointConfig,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_in_flight() -> usize {
    10
}

fn default_idempotency_header() -> String {
    "X-Idempotency-Key".to_string()
}

fn default_weight_limit() -> u32 {
    1_200
}

fn default_api_key_env() -> String {
    "XARB_API_KEY".to_string()
}

impl Default for RestSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            timeout_ms: default_timeout_ms(),
            max_in_flight: default_max_in_flight(),
            idempotency_header: default_idempotency_header(),
            used_weight_header: None,
            weight_limit: default_weight_limit(),
            api_key_header: None,
            api_key_env: default_api_key_env(),
            retry: RetrySettings::default(),
            endpoints: Vec::new(),
            default_bucket: default_bucket(),
        }
    }
}

impl RestSettings {
    pub fn to_rest_config(&self) -> RestConfig {
        RestConfig {
            base_url: self.base_url.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
            idempotency_header: self.idempotency_header.clone(),
            weight_header: self
                .used_weight_header
                .clone()
                .map(|name| (name, self.weight_limit)),
            retry: RetryConfig {
                max_attempts: self.retry.max_attempts,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
            },
            limiter: RateLimiterConfig {
                max_in_flight: self.max_in_flight,
                endpoints: self.endpoints.iter().map(EndpointConfig::to_bucket).collect(),
                default_bucket: self.default_bucket.to_bucket(),
            },
        }
    }
}

/// `[auth]` section. Only private streams use it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// REST endpoint that creates (POST) and extends (PUT) listen keys.
    #[serde(default)]
    pub listen_key_endpoint: Option<String>,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_max_regenerate_attempts")]
    pub max_regenerate_attempts: u32,
}

fn default_keepalive_interval_ms() -> u64 {
    30 * 60 * 1_000
}

fn default_max_regenerate_attempts() -> u32 {
    3
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            listen_key_endpoint: None,
            keepalive_interval_ms: default_keepalive_interval_ms(),
            max_regenerate_attempts: default_max_regenerate_attempts(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
    #[serde(default)]
    pub rest: RestSettings,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl AppConfig {
    /// Load from a specific file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` with `XARB__SECTION__KEY` environment overrides on top.
    pub fn load(path: &str) -> AppResult<Self> {
        if !Path::new(path).exists() {
            return Err(AppError::Config(format!("Config file not found: {path}")));
        }

        let settings = ::config::Config::builder()
            .add_source(::config::File::from(Path::new(path)).format(::config::FileFormat::Toml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        let mut names = BTreeSet::new();
        for stream in &self.streams {
            if !names.insert(stream.name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate stream name {}",
                    stream.name
                )));
            }
            if stream.url.is_empty() {
                return Err(AppError::Config(format!("stream {} has no url", stream.name)));
            }
            if stream.ping_interval_ms == 0 || stream.ping_timeout_ms == 0 {
                return Err(AppError::Config(format!(
                    "stream {}: ping interval and timeout must be positive",
                    stream.name
                )));
            }
            if stream.kind == StreamKind::Private && self.auth.listen_key_endpoint.is_none() {
                return Err(AppError::Config(format!(
                    "private stream {} needs auth.listen_key_endpoint",
                    stream.name
                )));
            }
            stream.subscription_entries()?;
        }
        if self.auth.keepalive_interval_ms == 0 {
            return Err(AppError::Config(
                "auth.keepalive_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn has_private_streams(&self) -> bool {
        self.streams.iter().any(|s| s.kind == StreamKind::Private)
    }
}
