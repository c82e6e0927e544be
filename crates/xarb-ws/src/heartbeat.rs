//! Heartbeat monitoring for stream connections.
//!
//! Tracks liveness (any inbound frame, pong or server ping) against the
//! pings we send. A ping that sees no liveness within `timeout` means the
//! transport is dead even if the socket still looks open.

use parking_lot::RwLock;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct HeartbeatState {
    last_ping: Option<Instant>,
    last_liveness: Instant,
    waiting_for_liveness: bool,
}

/// Heartbeat monitor for one connection.
pub struct HeartbeatMonitor {
    /// How long the connection may stay quiet before we ping.
    interval: Duration,
    /// How long to wait for liveness after a ping.
    timeout: Duration,
    state: RwLock<HeartbeatState>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            state: RwLock::new(HeartbeatState {
                last_ping: None,
                last_liveness: Instant::now(),
                waiting_for_liveness: false,
            }),
        }
    }

    /// Reset state (called when a connection becomes active).
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.last_ping = None;
        state.last_liveness = Instant::now();
        state.waiting_for_liveness = false;
    }

    /// Record that a ping was sent.
    pub fn record_ping(&self) {
        let mut state = self.state.write();
        state.last_ping = Some(Instant::now());
        state.waiting_for_liveness = true;
    }

    /// Record any liveness signal from the peer.
    pub fn record_liveness(&self) {
        let now = Instant::now();
        let mut state = self.state.write();
        if state.waiting_for_liveness {
            if let Some(ping) = state.last_ping {
                debug!(rtt_ms = (now - ping).as_millis() as u64, "Liveness after ping");
            }
        }
        state.last_liveness = now;
        state.waiting_for_liveness = false;
    }

    /// Whether the last ping went unanswered for longer than the timeout.
    pub fn is_timed_out(&self) -> bool {
        let state = self.state.read();
        if !state.waiting_for_liveness {
            return false;
        }
        state
            .last_ping
            .is_some_and(|ping| ping.elapsed() > self.timeout)
    }

    /// Whether a ping is due: quiet for a full interval and not already waiting.
    pub fn should_send_ping(&self) -> bool {
        let state = self.state.read();
        !state.waiting_for_liveness && state.last_liveness.elapsed() >= self.interval
    }

    /// Cadence of liveness checks: half of the shorter of interval and timeout.
    pub fn check_interval(&self) -> Duration {
        (self.interval.min(self.timeout) / 2).max(Duration::from_millis(10))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn time_since_liveness(&self) -> Duration {
        self.state.read().last_liveness.elapsed()
    }
}
