//! Main application orchestration.
//!
//! Owns every stream and the shared REST client. Nothing here is global:
//! adapters, dispatchers and providers are built per stream and injected.

use crate::config::{AppConfig, AuthConfig, RestSettings, StreamConfig, StreamKind};
use crate::error::{AppError, AppResult};
use crate::listen_key::ListenKeyProvider;
use dashmap::DashMap;
use futures_util::future::{join_all, select_all};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use xarb_core::ParsedMessage;
use xarb_rest::{ApiKeySigner, RestClient};
use xarb_telemetry::Metrics;
use xarb_ws::{ConnectionManager, JsonWireAdapter, MessageDispatcher};

/// Dispatched event counts per (stream, kind).
#[derive(Debug, Default)]
pub struct EventStats {
    counts: DashMap<(String, &'static str), u64>,
}

impl EventStats {
    fn record(&self, stream: &str, kind: &'static str) {
        *self.counts.entry((stream.to_string(), kind)).or_insert(0) += 1;
    }

    pub fn count(&self, stream: &str, kind: &'static str) -> u64 {
        self.counts
            .get(&(stream.to_string(), kind))
            .map(|c| *c)
            .unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|e| *e.value()).sum()
    }
}

/// Main application.
pub struct Application {
    config: AppConfig,
    rest: Arc<RestClient>,
    streams: Vec<Arc<ConnectionManager>>,
    stats: Arc<EventStats>,
}

impl Application {
    /// Build the REST client and one connection manager per stream.
    ///
    /// Nothing connects until `run`.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        config.validate()?;

        let rest = Arc::new(build_rest_client(&config.rest)?);
        let stats = Arc::new(EventStats::default());
        let streams = config
            .streams
            .iter()
            .map(|stream| build_stream(stream, &config.auth, &rest, &stats))
            .collect::<AppResult<Vec<_>>>()?;

        info!(
            streams = streams.len(),
            rest_base_url = %config.rest.base_url,
            "Application initialized"
        );
        Ok(Self {
            config,
            rest,
            streams,
            stats,
        })
    }

    pub fn rest(&self) -> Arc<RestClient> {
        Arc::clone(&self.rest)
    }

    pub fn streams(&self) -> &[Arc<ConnectionManager>] {
        &self.streams
    }

    pub fn stream(&self, name: &str) -> Option<&Arc<ConnectionManager>> {
        self.streams.iter().find(|s| s.name() == name)
    }

    pub fn stats(&self) -> Arc<EventStats> {
        Arc::clone(&self.stats)
    }

    /// Run until ctrl-c or the first fatal stream error.
    pub async fn run(self) -> AppResult<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for ctrl-c, running until a stream fails");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run until `shutdown` completes or a stream fails fatally, then stop
    /// every stream.
    pub async fn run_until<F>(&self, shutdown: F) -> AppResult<()>
    where
        F: Future<Output = ()>,
    {
        for (stream, stream_config) in self.streams.iter().zip(&self.config.streams) {
            let entries = stream_config.subscription_entries()?;
            if !entries.is_empty() {
                stream.registry().subscribe(&entries).await?;
            }
        }
        for stream in &self.streams {
            stream.start()?;
        }
        info!(streams = self.streams.len(), "Application running");

        let outcome = if self.streams.is_empty() {
            shutdown.await;
            info!("Shutdown signal received");
            Ok(())
        } else {
            let joins = self.streams.iter().map(|stream| {
                Box::pin(async move { (stream.name().to_string(), stream.join().await) })
            });
            tokio::select! {
                _ = shutdown => {
                    info!("Shutdown signal received");
                    Ok(())
                }
                ((name, result), _, _) = select_all(joins) => match result {
                    Ok(()) => Ok(()),
                    Err(source) => {
                        error!(stream = %name, error = %source, "Fatal stream error, shutting down");
                        Err(AppError::StreamFailed { stream: name, source })
                    }
                }
            }
        };

        self.shutdown().await;
        outcome
    }

    async fn shutdown(&self) {
        join_all(self.streams.iter().map(|stream| stream.stop())).await;
        for stream in &self.streams {
            if let Err(e) = stream.join().await {
                warn!(stream = %stream.name(), error = %e, "Stream ended with error during shutdown");
            }
        }

        info!(events = self.stats.total(), "All streams stopped");
        match Metrics::gather_text() {
            Ok(text) => debug!(metrics = %text, "Final metrics"),
            Err(e) => warn!(error = %e, "Failed to render metrics"),
        }
    }
}

fn build_rest_client(settings: &RestSettings) -> AppResult<RestClient> {
    let config = settings.to_rest_config();
    let client = match &settings.api_key_header {
        Some(header) => {
            let signer = ApiKeySigner::from_env(header, &settings.api_key_env)?;
            RestClient::with_signer(config, Arc::new(signer))?
        }
        None => RestClient::new(config)?,
    };
    Ok(client)
}

fn build_stream(
    config: &StreamConfig,
    auth: &AuthConfig,
    rest: &Arc<RestClient>,
    stats: &Arc<EventStats>,
) -> AppResult<Arc<ConnectionManager>> {
    let dispatcher = Arc::new(MessageDispatcher::new(&config.name));
    for channel in config.bound_channels()? {
        let stats = Arc::clone(stats);
        let stream = config.name.clone();
        dispatcher.bind(channel, move |msg| {
            let stats = Arc::clone(&stats);
            let stream = stream.clone();
            async move {
                log_event(&stream, &msg);
                stats.record(&stream, msg.kind());
            }
        });
    }

    let mut adapter = JsonWireAdapter::new(config.adapter_config(auth));
    if config.kind == StreamKind::Private {
        let endpoint = auth.listen_key_endpoint.clone().ok_or_else(|| {
            AppError::Config(format!("private stream {} needs a listen key endpoint", config.name))
        })?;
        adapter = adapter.with_token_provider(Arc::new(ListenKeyProvider::new(
            Arc::clone(rest),
            endpoint,
        )));
    }

    debug!(stream = %config.name, url = %config.url, kind = ?config.kind, "Stream configured");
    Ok(Arc::new(ConnectionManager::new(
        config.connection_config(auth),
        Arc::new(adapter),
        dispatcher,
    )))
}

fn log_event(stream: &str, msg: &ParsedMessage) {
    match msg {
        ParsedMessage::TradeEvent {
            symbol, payload, ..
        } => debug!(
            stream,
            symbol = symbol.as_deref().unwrap_or(""),
            price = %payload.price,
            size = %payload.size,
            side = %payload.side,
            "Trade"
        ),
        ParsedMessage::OrderBookUpdate {
            symbol, payload, ..
        } => debug!(
            stream,
            symbol = symbol.as_deref().unwrap_or(""),
            bids = payload.bids.len(),
            asks = payload.asks.len(),
            "Order book update"
        ),
        ParsedMessage::OrderUpdate { payload, .. } => info!(
            stream,
            order_id = %payload.order_id,
            status = ?payload.status,
            filled = %payload.filled_size,
            "Order update"
        ),
        ParsedMessage::BalanceUpdate { payload, .. } => info!(
            stream,
            asset = %payload.asset,
            free = %payload.free,
            locked = %payload.locked,
            "Balance update"
        ),
        other => debug!(stream, kind = other.kind(), "Event"),
    }
}
