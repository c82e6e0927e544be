//! Subscription registry.
//!
//! The desired set is the single source of truth. Changes made while the
//! connection is active go out on the wire immediately; changes made while
//! it is not are only recorded. Every new connection replays the whole
//! desired set, never a diff against what the previous connection had.

use crate::adapter::{WireAdapter, WireMessage};
use crate::dispatcher::MessageDispatcher;
use crate::error::{WsError, WsResult};
use crate::ws_write_handle::WsWriteHandle;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};
use xarb_core::{SubscriptionAction, SubscriptionEntry};

#[derive(Default)]
struct RegistryState {
    desired: BTreeSet<SubscriptionEntry>,
    /// Writer of the connection currently accepting live changes.
    link: Option<WsWriteHandle>,
    /// Generation whose replay has been produced.
    restored_generation: Option<u64>,
    /// Entries acknowledged by the venue on the current connection.
    acked: HashSet<SubscriptionEntry>,
}

pub struct SubscriptionRegistry {
    adapter: Arc<dyn WireAdapter>,
    dispatcher: Arc<MessageDispatcher>,
    state: RwLock<RegistryState>,
    /// Held from a set change until its frames are queued, so frames go
    /// out in the order the set changed.
    change_lock: TokioMutex<()>,
}

impl SubscriptionRegistry {
    pub fn new(adapter: Arc<dyn WireAdapter>, dispatcher: Arc<MessageDispatcher>) -> Self {
        Self {
            adapter,
            dispatcher,
            state: RwLock::new(RegistryState::default()),
            change_lock: TokioMutex::new(()),
        }
    }

    /// Add entries to the desired set.
    ///
    /// Entries already desired are skipped. Fails before changing anything
    /// if an entry's channel has no bound handler.
    pub async fn subscribe(&self, entries: &[SubscriptionEntry]) -> WsResult<usize> {
        if let Some(unbound) = entries
            .iter()
            .find(|e| !self.dispatcher.is_bound(&e.channel))
        {
            return Err(WsError::UnboundChannel(unbound.channel.clone()));
        }
        self.apply(SubscriptionAction::Subscribe, entries).await
    }

    /// Remove entries from the desired set. Entries not desired are skipped.
    pub async fn unsubscribe(&self, entries: &[SubscriptionEntry]) -> WsResult<usize> {
        self.apply(SubscriptionAction::Unsubscribe, entries).await
    }

    async fn apply(
        &self,
        action: SubscriptionAction,
        entries: &[SubscriptionEntry],
    ) -> WsResult<usize> {
        let _ordered = self.change_lock.lock().await;

        // Update the set and capture the live writer under one lock so a
        // concurrent restore either sees the change or we see its link.
        let (changed, link) = {
            let mut state = self.state.write();
            let mut changed = Vec::new();
            for entry in entries {
                let is_change = match action {
                    SubscriptionAction::Subscribe => state.desired.insert(entry.clone()),
                    SubscriptionAction::Unsubscribe => {
                        state.acked.remove(entry);
                        state.desired.remove(entry)
                    }
                };
                if is_change {
                    changed.push(entry.clone());
                }
            }
            (changed, state.link.clone())
        };

        if changed.is_empty() {
            return Ok(0);
        }

        let Some(link) = link else {
            debug!(%action, count = changed.len(), "Connection not active, change deferred");
            return Ok(changed.len());
        };

        let mut messages = Vec::new();
        for entry in &changed {
            messages.extend(self.adapter.encode_subscription(action, entry)?);
        }
        for message in messages {
            // A failed send means the connection is going away; the next
            // replay covers the desired set.
            if let Err(e) = link.send(message).await {
                warn!(%action, error = %e, "Live subscription send failed, deferring to replay");
                break;
            }
        }
        debug!(%action, count = changed.len(), generation = link.generation(), "Subscription change sent");
        Ok(changed.len())
    }

    /// Produce the SUBSCRIBE replay for a new connection and start accepting
    /// live changes on its writer.
    ///
    /// Idempotent per generation: a second call for the same generation
    /// returns nothing.
    pub fn restore_on_reconnect(
        &self,
        generation: u64,
        link: WsWriteHandle,
    ) -> WsResult<Vec<WireMessage>> {
        let mut state = self.state.write();
        if state.restored_generation == Some(generation) {
            debug!(generation, "Replay already produced for generation");
            return Ok(Vec::new());
        }

        let mut messages = Vec::with_capacity(state.desired.len());
        for entry in &state.desired {
            messages.extend(
                self.adapter
                    .encode_subscription(SubscriptionAction::Subscribe, entry)?,
            );
        }

        state.restored_generation = Some(generation);
        state.acked.clear();
        state.link = Some(link);

        info!(
            generation,
            entries = state.desired.len(),
            frames = messages.len(),
            "Subscription replay prepared"
        );
        Ok(messages)
    }

    /// Stop sending live changes (connection lost or closed).
    pub fn deactivate(&self) {
        let mut state = self.state.write();
        if state.link.take().is_some() {
            debug!("Subscription registry deactivated");
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.read().link.is_some()
    }

    /// Record a venue acknowledgement for the current connection.
    pub fn record_ack(&self, entry: SubscriptionEntry, action: SubscriptionAction) {
        let mut state = self.state.write();
        match action {
            SubscriptionAction::Subscribe if state.desired.contains(&entry) => {
                state.acked.insert(entry);
            }
            SubscriptionAction::Subscribe => {
                debug!(%entry, "Ack for entry no longer desired");
            }
            SubscriptionAction::Unsubscribe => {
                state.acked.remove(&entry);
            }
        }
    }

    /// Desired entries not yet acknowledged on the current connection.
    pub fn pending_acks(&self) -> Vec<SubscriptionEntry> {
        let state = self.state.read();
        state
            .desired
            .iter()
            .filter(|e| !state.acked.contains(*e))
            .cloned()
            .collect()
    }

    /// Snapshot of the desired set in replay order.
    pub fn desired(&self) -> Vec<SubscriptionEntry> {
        self.state.read().desired.iter().cloned().collect()
    }

    pub fn is_desired(&self, entry: &SubscriptionEntry) -> bool {
        self.state.read().desired.contains(entry)
    }

    pub fn len(&self) -> usize {
        self.state.read().desired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().desired.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json_adapter::{JsonAdapterConfig, JsonWireAdapter};
    use crate::ws_write_handle::WsOutbound;
    use tokio::sync::mpsc;
    use xarb_core::ChannelKey;

    fn key(s: &str) -> ChannelKey {
        ChannelKey::new(s).unwrap()
    }

    fn entry(channel: &str, symbol: &str) -> SubscriptionEntry {
        SubscriptionEntry::symbol(key(channel), symbol)
    }

    fn registry() -> SubscriptionRegistry {
        let dispatcher = Arc::new(MessageDispatcher::new("test"));
        dispatcher.bind(key("depth"), |_| async {});
        dispatcher.bind(key("trade"), |_| async {});
        let adapter = Arc::new(JsonWireAdapter::new(JsonAdapterConfig::default()));
        SubscriptionRegistry::new(adapter, dispatcher)
    }

    fn drain(rx: &mut mpsc::Receiver<WsOutbound>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let WireMessage::Text(text) = msg.message {
                out.push(text);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_deferred_while_inactive() {
        let registry = registry();
        let added = registry
            .subscribe(&[entry("depth", "BTC"), entry("depth", "ETH")])
            .await
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(registry.len(), 2);
        assert!(!registry.is_active());
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_is_noop() {
        let registry = registry();
        let (tx, mut rx) = mpsc::channel(16);
        registry
            .restore_on_reconnect(1, WsWriteHandle::new(tx, 1))
            .unwrap();

        assert_eq!(registry.subscribe(&[entry("depth", "BTC")]).await.unwrap(), 1);
        assert_eq!(registry.subscribe(&[entry("depth", "BTC")]).await.unwrap(), 0);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_live_change_sent_when_active() {
        let registry = registry();
        let (tx, mut rx) = mpsc::channel(16);
        registry
            .restore_on_reconnect(1, WsWriteHandle::new(tx, 1))
            .unwrap();

        registry.subscribe(&[entry("trade", "BTC")]).await.unwrap();
        registry.unsubscribe(&[entry("trade", "BTC")]).await.unwrap();

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("\"subscribe\""));
        assert!(sent[1].contains("\"unsubscribe\""));
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_changes_sent_in_set_order() {
        let registry = Arc::new(registry());
        let (tx, mut rx) = mpsc::channel(1024);
        registry
            .restore_on_reconnect(1, WsWriteHandle::new(tx, 1))
            .unwrap();
        let e = entry("trade", "BTC");

        let mut sent = Vec::new();
        for _ in 0..50 {
            let sub = {
                let registry = Arc::clone(&registry);
                let e = e.clone();
                tokio::spawn(async move { registry.subscribe(&[e]).await.unwrap() })
            };
            let unsub = {
                let registry = Arc::clone(&registry);
                let e = e.clone();
                tokio::spawn(async move { registry.unsubscribe(&[e]).await.unwrap() })
            };
            sub.await.unwrap();
            unsub.await.unwrap();

            sent.extend(drain(&mut rx));
            let last = sent.last().expect("each round changes the set");
            if registry.is_desired(&e) {
                assert!(last.contains("\"subscribe\""), "set has entry, wire says {last}");
            } else {
                assert!(last.contains("\"unsubscribe\""), "set lacks entry, wire says {last}");
            }
        }

        // Starting from empty, frames must alternate.
        for (i, frame) in sent.iter().enumerate() {
            let op = if i % 2 == 0 { "\"subscribe\"" } else { "\"unsubscribe\"" };
            assert!(frame.contains(op), "frame {i} out of order: {frame}");
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_is_noop() {
        let registry = registry();
        let (tx, mut rx) = mpsc::channel(16);
        registry
            .restore_on_reconnect(1, WsWriteHandle::new(tx, 1))
            .unwrap();

        let removed = registry.unsubscribe(&[entry("depth", "DOGE")]).await.unwrap();
        assert_eq!(removed, 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_unbound_channel_rejected() {
        let registry = registry();
        let result = registry.subscribe(&[entry("orders", "BTC")]).await;
        assert!(matches!(result, Err(WsError::UnboundChannel(_))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_restore_replays_full_set_once_per_generation() {
        let registry = registry();
        registry
            .subscribe(&[entry("depth", "BTC"), entry("trade", "ETH")])
            .await
            .unwrap();

        let (tx, _rx) = mpsc::channel(16);
        let first = registry
            .restore_on_reconnect(5, WsWriteHandle::new(tx.clone(), 5))
            .unwrap();
        let second = registry
            .restore_on_reconnect(5, WsWriteHandle::new(tx.clone(), 5))
            .unwrap();
        assert_eq!(first.len(), 2);
        assert!(second.is_empty());

        // A new connection replays everything again, subscribes only.
        let third = registry
            .restore_on_reconnect(6, WsWriteHandle::new(tx, 6))
            .unwrap();
        assert_eq!(third.len(), 2);
        assert!(third.iter().all(|m| match m {
            WireMessage::Text(t) => t.contains("\"subscribe\""),
            WireMessage::Binary(_) => false,
        }));
    }

    #[tokio::test]
    async fn test_desired_set_matches_set_algebra() {
        // Interleave calls across active and inactive phases.
        let registry = registry();
        let mut expected = BTreeSet::new();
        let symbols = ["BTC", "ETH", "SOL", "XRP"];
        let (tx, _rx) = mpsc::channel(256);

        for (step, symbol) in symbols.iter().cycle().take(24).enumerate() {
            if step % 7 == 3 {
                registry
                    .restore_on_reconnect(step as u64, WsWriteHandle::new(tx.clone(), step as u64))
                    .unwrap();
            }
            if step % 5 == 4 {
                registry.deactivate();
            }

            let e = entry(if step % 2 == 0 { "depth" } else { "trade" }, symbol);
            if step % 3 == 2 {
                registry.unsubscribe(&[e.clone()]).await.unwrap();
                expected.remove(&e);
            } else {
                registry.subscribe(&[e.clone()]).await.unwrap();
                expected.insert(e);
            }
        }

        let desired: BTreeSet<_> = registry.desired().into_iter().collect();
        assert_eq!(desired, expected);
    }

    #[tokio::test]
    async fn test_pending_acks() {
        let registry = registry();
        registry
            .subscribe(&[entry("depth", "BTC"), entry("depth", "ETH")])
            .await
            .unwrap();
        let (tx, _rx) = mpsc::channel(16);
        registry
            .restore_on_reconnect(1, WsWriteHandle::new(tx, 1))
            .unwrap();

        registry.record_ack(entry("depth", "BTC"), SubscriptionAction::Subscribe);
        assert_eq!(registry.pending_acks(), vec![entry("depth", "ETH")]);
    }
}
