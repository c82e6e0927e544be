//! Write handle for sending frames on the live connection.
//!
//! The connection manager owns the socket; everyone else queues frames
//! through this handle. Each handle is bound to one connection generation,
//! and the manager drops frames queued for an older generation so nothing
//! leaks across a reconnect boundary.

use crate::adapter::WireMessage;
use crate::error::{WsError, WsResult};
use tokio::sync::mpsc;
use tracing::debug;

/// Frame queued for the connection's writer.
#[derive(Debug)]
pub struct WsOutbound {
    /// Connection generation the frame was produced for.
    pub generation: u64,
    pub message: WireMessage,
}

/// Cloneable handle to the writer of one connection generation.
#[derive(Clone)]
pub struct WsWriteHandle {
    tx: mpsc::Sender<WsOutbound>,
    generation: u64,
}

impl WsWriteHandle {
    pub fn new(tx: mpsc::Sender<WsOutbound>, generation: u64) -> Self {
        Self { tx, generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a frame for sending.
    ///
    /// Only confirms the frame was queued; delivery depends on the
    /// connection surviving until the writer picks it up.
    pub async fn send(&self, message: WireMessage) -> WsResult<()> {
        self.tx
            .send(WsOutbound {
                generation: self.generation,
                message,
            })
            .await
            .map_err(|_| WsError::SendFailed("writer channel closed".to_string()))?;
        debug!(generation = self.generation, "Frame queued");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
