//! Session token keepalive for private streams.
//!
//! Runs beside the connection for the whole life of the manager. Refreshes
//! the token on a fixed cadence; when a refresh fails the token is
//! regenerated, which invalidates the live session and forces a reconnect.

use crate::adapter::WireAdapter;
use crate::error::WsError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Out-of-band instruction for the connection run loop.
#[derive(Debug)]
pub enum ControlSignal {
    /// Tear down connection `generation` and reconnect. Ignored by any later
    /// connection, which already uses the new token.
    Reconnect { generation: u64, reason: String },
    /// Stop the stream with this error.
    Fatal(WsError),
}

pub(crate) struct KeepaliveTask {
    pub stream: String,
    pub adapter: Arc<dyn WireAdapter>,
    pub interval: Duration,
    pub max_regenerate_attempts: u32,
    pub control: mpsc::Sender<ControlSignal>,
    /// Generation counter of the owning connection manager.
    pub generation: Arc<AtomicU64>,
    pub cancel: CancellationToken,
}

impl KeepaliveTask {
    pub(crate) async fn run(self) {
        info!(stream = %self.stream, interval_ms = self.interval.as_millis() as u64, "Keepalive started");

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {}
            }

            let refresh = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                result = self.adapter.refresh_token() => result,
            };

            match refresh {
                Ok(()) => debug!(stream = %self.stream, "Session token refreshed"),
                Err(e) => {
                    warn!(stream = %self.stream, error = %e, "Token refresh failed, regenerating");
                    let Some(signal) = self.regenerate().await else {
                        break;
                    };
                    let fatal = matches!(signal, ControlSignal::Fatal(_));
                    if self.control.send(signal).await.is_err() || fatal {
                        break;
                    }
                }
            }
        }

        debug!(stream = %self.stream, "Keepalive stopped");
    }

    /// `None` when cancelled mid-way.
    async fn regenerate(&self) -> Option<ControlSignal> {
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=self.max_regenerate_attempts {
            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return None,
                result = self.adapter.regenerate_token() => result,
            };
            match result {
                Ok(()) => {
                    // Read after the token is installed: any connection that
                    // starts later picks up the new token.
                    let generation = self.generation.load(Ordering::SeqCst);
                    info!(stream = %self.stream, attempt, generation, "Session token regenerated, forcing reconnect");
                    return Some(ControlSignal::Reconnect {
                        generation,
                        reason: "session token regenerated".to_string(),
                    });
                }
                Err(e) => {
                    warn!(stream = %self.stream, attempt, error = %e, "Token regeneration failed");
                    last_error = e.to_string();
                }
            }
        }

        error!(
            stream = %self.stream,
            attempts = self.max_regenerate_attempts,
            "Token regeneration attempts exhausted"
        );
        Some(ControlSignal::Fatal(WsError::Authentication(format!(
            "token regeneration failed after {} attempts: {}",
            self.max_regenerate_attempts, last_error
        ))))
    }
}
