//! WebSocket connection manager.
//!
//! Owns one logical stream: connect, authenticate, replay subscriptions,
//! read and dispatch, and reconnect with backoff when the transport fails.
//! Every reconnect builds a fresh transport and a new generation; nothing
//! from the previous transport is reused.

use crate::adapter::{RawFrame, WireAdapter};
use crate::dispatcher::MessageDispatcher;
use crate::error::{WsError, WsResult};
use crate::heartbeat::HeartbeatMonitor;
use crate::keepalive::{ControlSignal, KeepaliveTask};
use crate::subscription::SubscriptionRegistry;
use crate::ws_write_handle::{WsOutbound, WsWriteHandle};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use xarb_core::{ParsedMessage, ReconnectionPolicy, SubscriptionEntry};
use xarb_telemetry::Metrics;

const TRANSITION_CAPACITY: usize = 64;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Stream name for logs and metrics.
    pub name: String,
    /// Quiet period after which a heartbeat is sent.
    pub ping_interval: Duration,
    /// Liveness must arrive within this after a heartbeat.
    pub ping_timeout: Duration,
    /// Extra random delay on top of the backoff, as a fraction of it (0 = none).
    pub jitter_fraction: f64,
    /// Token regeneration attempts before a private stream gives up.
    pub max_token_regenerate_attempts: u32,
    /// Capacity of the outbound frame queue.
    pub outbound_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: "stream".to_string(),
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            jitter_fraction: 0.0,
            max_token_regenerate_attempts: 3,
            outbound_buffer: 256,
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribing,
    Active,
    Reconnecting,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Subscribing => "subscribing",
            Self::Active => "active",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed state change.
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub at: DateTime<Utc>,
    /// Connection generation at the time of the change.
    pub generation: u64,
}

/// Reconnect bookkeeping for the current outage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconnectAttempt {
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub last_delay: Option<Duration>,
}

#[derive(Default)]
struct Tasks {
    run: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
}

/// WebSocket connection manager.
pub struct ConnectionManager {
    config: ConnectionConfig,
    adapter: Arc<dyn WireAdapter>,
    dispatcher: Arc<MessageDispatcher>,
    registry: Arc<SubscriptionRegistry>,
    heartbeat: HeartbeatMonitor,
    state: RwLock<ConnectionState>,
    transitions: broadcast::Sender<StateTransition>,
    attempt: RwLock<ReconnectAttempt>,
    /// When the current connection became active.
    active_since: RwLock<Option<Instant>>,
    generation: Arc<AtomicU64>,
    outbound_tx: mpsc::Sender<WsOutbound>,
    outbound_rx: TokioMutex<mpsc::Receiver<WsOutbound>>,
    control_tx: mpsc::Sender<ControlSignal>,
    control_rx: TokioMutex<mpsc::Receiver<ControlSignal>>,
    /// Cancelled by `stop()` or when the run loop ends.
    shutdown: CancellationToken,
    /// Cancelled once the run loop has finished and stored its outcome.
    finished: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Tasks>,
    outcome: Mutex<Option<WsResult<()>>>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        adapter: Arc<dyn WireAdapter>,
        dispatcher: Arc<MessageDispatcher>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_buffer.max(1));
        let (control_tx, control_rx) = mpsc::channel(8);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        let registry = Arc::new(SubscriptionRegistry::new(
            Arc::clone(&adapter),
            Arc::clone(&dispatcher),
        ));

        Self {
            heartbeat: HeartbeatMonitor::new(config.ping_interval, config.ping_timeout),
            config,
            adapter,
            dispatcher,
            registry,
            state: RwLock::new(ConnectionState::Disconnected),
            transitions,
            attempt: RwLock::new(ReconnectAttempt::default()),
            active_since: RwLock::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            outbound_tx,
            outbound_rx: TokioMutex::new(outbound_rx),
            control_tx,
            control_rx: TokioMutex::new(control_rx),
            shutdown: CancellationToken::new(),
            finished: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Tasks::default()),
            outcome: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Shared subscription registry for this stream.
    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn dispatcher(&self) -> Arc<MessageDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    pub fn attempt(&self) -> ReconnectAttempt {
        self.attempt.read().clone()
    }

    /// Generation of the most recent connection (0 before the first).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Spawn the run loop (and the keepalive task for private streams).
    pub fn start(self: &Arc<Self>) -> WsResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(WsError::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(WsError::AlreadyStarted);
        }

        info!(stream = %self.config.name, venue = self.adapter.venue(), "Starting stream");
        let mut tasks = self.tasks.lock();

        if self.adapter.requires_auth() {
            if let Some(interval) = self.adapter.keepalive_interval() {
                let keepalive = KeepaliveTask {
                    stream: self.config.name.clone(),
                    adapter: Arc::clone(&self.adapter),
                    interval,
                    max_regenerate_attempts: self.config.max_token_regenerate_attempts,
                    control: self.control_tx.clone(),
                    generation: Arc::clone(&self.generation),
                    cancel: self.shutdown.child_token(),
                };
                tasks.keepalive = Some(tokio::spawn(keepalive.run()));
            }
        }

        let this = Arc::clone(self);
        tasks.run = Some(tokio::spawn(async move {
            let result = this.run().await;
            this.finish(result);
        }));
        Ok(())
    }

    /// Stop the stream and wait for every task to exit. Idempotent.
    pub async fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!(stream = %self.config.name, "Stopping stream");
        }
        self.shutdown.cancel();

        let (run, keepalive) = {
            let mut tasks = self.tasks.lock();
            (tasks.run.take(), tasks.keepalive.take())
        };
        if let Some(handle) = keepalive {
            if let Err(e) = handle.await {
                warn!(stream = %self.config.name, error = %e, "Keepalive task ended abnormally");
            }
        }
        if let Some(handle) = run {
            if let Err(e) = handle.await {
                warn!(stream = %self.config.name, error = %e, "Run loop ended abnormally");
                self.finish(Err(WsError::TaskFailed(e.to_string())));
            }
        }

        if !self.started.load(Ordering::SeqCst) {
            self.finish(Ok(()));
        }
        self.set_state(ConnectionState::Closed);
    }

    /// Wait for the run loop to end.
    ///
    /// Returns the fatal error that ended the stream, if any. The error is
    /// handed out once; later calls return `Ok(())`.
    pub async fn join(&self) -> WsResult<()> {
        self.finished.cancelled().await;
        self.outcome.lock().take().unwrap_or(Ok(()))
    }

    /// Whether the run loop has ended.
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    fn finish(&self, result: WsResult<()>) {
        if self.finished.is_cancelled() {
            return;
        }
        match &result {
            Ok(()) => info!(stream = %self.config.name, "Stream stopped"),
            Err(e) => error!(stream = %self.config.name, error = %e, "Stream failed"),
        }
        self.registry.deactivate();
        self.set_state(ConnectionState::Closed);
        *self.outcome.lock() = Some(result);
        self.shutdown.cancel();
        self.finished.cancel();
    }

    fn set_state(&self, to: ConnectionState) {
        let from = {
            let mut state = self.state.write();
            if *state == ConnectionState::Closed || *state == to {
                return;
            }
            std::mem::replace(&mut *state, to)
        };

        let generation = self.generation();
        Metrics::ws_state_set(&self.config.name, to.as_str());
        info!(stream = %self.config.name, %from, %to, generation, "State transition");
        // No receivers is fine.
        let _ = self.transitions.send(StateTransition {
            from,
            to,
            at: Utc::now(),
            generation,
        });
    }

    async fn run(&self) -> WsResult<()> {
        let policy = self.adapter.get_reconnection_policy();
        let mut control_rx = self.control_rx.lock().await;

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let result = self.run_session(&mut control_rx).await;
            self.registry.deactivate();
            *self.active_since.write() = None;

            let error = match result {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if self.shutdown.is_cancelled() {
                debug!(stream = %self.config.name, error = %error, "Session ended during shutdown");
                return Ok(());
            }

            let kind = self.adapter.classify(&error);
            if !self.adapter.should_reconnect(&error) {
                error!(stream = %self.config.name, error = %error, kind = kind.as_str(), "Non-reconnectable error");
                return Err(error);
            }

            let attempt = {
                let mut record = self.attempt.write();
                record.attempt_count += 1;
                record.last_error = Some(error.to_string());
                record.attempt_count
            };
            if policy.is_exhausted(attempt) {
                error!(stream = %self.config.name, attempts = policy.max_attempts, "Max reconnection attempts reached");
                return Err(WsError::MaxReconnectAttempts {
                    attempts: policy.max_attempts,
                    last: error.to_string(),
                });
            }

            let delay = self.backoff_delay(&policy, attempt);
            self.attempt.write().last_delay = Some(delay);
            self.set_state(ConnectionState::Reconnecting);
            Metrics::ws_reconnect(&self.config.name, kind.as_str());
            warn!(
                stream = %self.config.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                kind = kind.as_str(),
                "Reconnecting"
            );

            // No connection is live, so only a fatal signal matters here.
            let backoff = async {
                tokio::time::sleep(delay).await;
                Ok::<(), WsError>(())
            };
            if self.guarded(&mut control_rx, None, backoff).await?.is_none() {
                info!(stream = %self.config.name, "Shutdown requested during backoff");
                return Ok(());
            }
        }
    }

    /// Drive `operation` to completion unless shutdown or a control signal
    /// for connection `live` cuts it short. `Ok(None)` means shutdown.
    async fn guarded<T>(
        &self,
        control_rx: &mut mpsc::Receiver<ControlSignal>,
        live: Option<u64>,
        operation: impl Future<Output = WsResult<T>>,
    ) -> WsResult<Option<T>> {
        tokio::pin!(operation);
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return Ok(None),
                Some(signal) = control_rx.recv() => {
                    if let Some(e) = self.on_control(signal, live) {
                        return Err(e);
                    }
                }
                result = &mut operation => return result.map(Some),
            }
        }
    }

    /// Error that ends connection `live`, if `signal` applies to it.
    fn on_control(&self, signal: ControlSignal, live: Option<u64>) -> Option<WsError> {
        match signal {
            ControlSignal::Fatal(e) => Some(e),
            ControlSignal::Reconnect { generation, reason } if live == Some(generation) => {
                info!(stream = %self.config.name, generation, %reason, "Reconnect requested");
                Some(WsError::TokenRotated(reason))
            }
            ControlSignal::Reconnect { generation, reason } => {
                debug!(
                    stream = %self.config.name,
                    generation,
                    live = ?live,
                    %reason,
                    "Dropping reconnect request for an earlier connection"
                );
                None
            }
        }
    }

    fn backoff_delay(&self, policy: &ReconnectionPolicy, attempt: u32) -> Duration {
        let base = policy.delay(attempt);
        let fraction = self.config.jitter_fraction;
        if fraction <= 0.0 {
            return base;
        }

        // Cheap jitter from the clock's sub-second nanos.
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let unit = f64::from(nanos % 1_000_000) / 1_000_000.0;
        base + base.mul_f64(fraction.min(1.0) * unit)
    }

    /// One connection, from connect until it fails or shutdown.
    async fn run_session(&self, control_rx: &mut mpsc::Receiver<ControlSignal>) -> WsResult<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(ConnectionState::Connecting);

        let Some(mut stream) = self
            .guarded(control_rx, Some(generation), self.adapter.connect())
            .await?
        else {
            return Ok(());
        };
        debug!(stream = %self.config.name, generation, "Transport open");

        if self.adapter.requires_auth() {
            self.set_state(ConnectionState::Authenticating);
            let Some(accepted) = self
                .guarded(control_rx, Some(generation), self.adapter.authenticate(&mut stream))
                .await?
            else {
                return Ok(());
            };
            if !accepted {
                return Err(WsError::Authentication(
                    "venue rejected credentials".to_string(),
                ));
            }
            info!(stream = %self.config.name, "Authenticated");
        }

        self.set_state(ConnectionState::Subscribing);
        let replay = self
            .registry
            .restore_on_reconnect(generation, WsWriteHandle::new(self.outbound_tx.clone(), generation))?;
        for message in replay {
            stream.send(message.into()).await?;
        }

        self.heartbeat.reset();
        *self.active_since.write() = Some(Instant::now());
        self.set_state(ConnectionState::Active);

        let (mut write, mut read) = stream.split();
        let mut outbound_rx = self.outbound_rx.lock().await;
        let mut ticker = tokio::time::interval(self.heartbeat.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    info!(stream = %self.config.name, "Shutdown signal received in message loop");
                    if let Err(e) = write.send(Message::Close(None)).await {
                        debug!(stream = %self.config.name, error = %e, "Failed to send Close frame");
                    }
                    return Ok(());
                }

                Some(signal) = control_rx.recv() => {
                    if let Some(e) = self.on_control(signal, Some(generation)) {
                        let _ = write.send(Message::Close(None)).await;
                        return Err(e);
                    }
                }

                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_frame(RawFrame::Text(text)).await?;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        self.handle_frame(RawFrame::Binary(bytes)).await?;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        self.heartbeat.record_liveness();
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        self.heartbeat.record_liveness();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        // A close frame without a status code is 1005.
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((1005, String::new()));
                        warn!(stream = %self.config.name, code, %reason, "Closed by server");
                        return Err(WsError::ConnectionClosed { code, reason });
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        return Err(WsError::ConnectionClosed {
                            code: 1006,
                            reason: "stream ended".to_string(),
                        });
                    }
                },

                outbound = outbound_rx.recv() => {
                    if let Some(out) = outbound {
                        if out.generation == generation {
                            write.send(out.message.into()).await?;
                        } else {
                            debug!(
                                stream = %self.config.name,
                                frame_generation = out.generation,
                                generation,
                                "Dropping frame from previous connection"
                            );
                        }
                    }
                }

                _ = ticker.tick() => {
                    if self.heartbeat.is_timed_out() {
                        error!(stream = %self.config.name, "Heartbeat timeout");
                        return Err(WsError::HeartbeatTimeout);
                    }
                    if self.heartbeat.should_send_ping() {
                        let ping = self
                            .adapter
                            .handle_heartbeat()
                            .map(Message::from)
                            .unwrap_or_else(|| Message::Ping(Vec::new()));
                        write.send(ping).await?;
                        self.heartbeat.record_ping();
                        debug!(stream = %self.config.name, "Sent heartbeat");
                    }
                    self.reset_attempts_if_healthy();
                }
            }
        }
    }

    async fn handle_frame(&self, frame: RawFrame) -> WsResult<()> {
        self.heartbeat.record_liveness();

        match self.dispatcher.process_raw(self.adapter.as_ref(), frame) {
            ParsedMessage::Heartbeat | ParsedMessage::ProtocolError { .. } => Ok(()),
            ParsedMessage::SubscriptionAck {
                channel_key,
                symbol,
                action,
            } => {
                debug!(stream = %self.config.name, channel = %channel_key, ?symbol, %action, "Subscription acknowledged");
                self.registry
                    .record_ack(SubscriptionEntry::new(channel_key, symbol), action);
                Ok(())
            }
            data => tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    debug!(stream = %self.config.name, "Handler abandoned on shutdown");
                    Ok(())
                }
                result = self.dispatcher.dispatch(data) => result,
            },
        }
    }

    /// Clear the reconnect record once a connection has stayed up for a
    /// full heartbeat interval.
    fn reset_attempts_if_healthy(&self) {
        let healthy = self
            .active_since
            .read()
            .is_some_and(|since| since.elapsed() >= self.config.ping_interval);
        if !healthy {
            return;
        }
        let mut record = self.attempt.write();
        if record.attempt_count > 0 {
            info!(stream = %self.config.name, attempts = record.attempt_count, "Connection healthy, reconnect record reset");
            *record = ReconnectAttempt::default();
        }
    }
}
