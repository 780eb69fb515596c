//! Identity → outbound-queue map shared by every hub.
//!
//! A registry is owned by exactly one dispatch task, so it takes no locks.
//! Each connection has its own bounded queue; broadcasting uses `try_send`
//! and a full queue costs that one recipient the message, never the
//! broadcaster.
//!
//! Counters are atomics so health checks can read them from any task
//! without touching the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// Connection identity, unique per accepted socket.
pub type ConnId = Uuid;

/// Snapshot of registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_connections: usize,
}

/// Lock-free counters, shareable across registries of one hub.
#[derive(Debug, Default)]
pub struct RegistryCounters {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    active_connections: AtomicUsize,
}

impl RegistryCounters {
    pub fn snapshot(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// One live connection as seen by its registry.
///
/// Dropping the handle drops the queue's only sender, which ends the
/// connection's writer.
#[derive(Debug)]
pub struct ConnectionHandle<M, P> {
    id: ConnId,
    meta: M,
    outbound: mpsc::Sender<P>,
}

impl<M, P> ConnectionHandle<M, P> {
    /// Create a handle and its bounded outbound queue.
    pub fn new(meta: M, capacity: usize) -> (Self, mpsc::Receiver<P>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: Uuid::new_v4(),
            meta,
            outbound,
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn meta(&self) -> &M {
        &self.meta
    }

    /// False once the writer side has gone away.
    pub fn is_live(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Non-blocking enqueue of a message for this connection alone.
    pub fn try_send(&self, payload: P) -> Result<(), TrySendError<P>> {
        self.outbound.try_send(payload)
    }
}

/// Connection registry for one broadcast domain.
pub struct ConnectionRegistry<M, P> {
    connections: HashMap<ConnId, ConnectionHandle<M, P>>,
    counters: Arc<RegistryCounters>,
}

impl<M, P: Clone> ConnectionRegistry<M, P> {
    pub fn new() -> Self {
        Self::with_counters(Arc::new(RegistryCounters::default()))
    }

    /// Registry reporting into counters shared with other registries.
    pub fn with_counters(counters: Arc<RegistryCounters>) -> Self {
        Self {
            connections: HashMap::new(),
            counters,
        }
    }

    /// Insert a handle. The handle moves into the registry, so it cannot be
    /// registered anywhere else at the same time.
    pub fn register(&mut self, handle: ConnectionHandle<M, P>) {
        let id = handle.id;
        if self.connections.insert(id, handle).is_none() {
            self.counters.active_connections.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Remove a handle, closing its queue. Idempotent.
    pub fn unregister(&mut self, id: &ConnId) -> Option<ConnectionHandle<M, P>> {
        let removed = self.connections.remove(id);
        if removed.is_some() {
            self.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Enqueue `payload` for every live connection except `skip`.
    pub fn broadcast(&self, payload: &P, skip: Option<ConnId>) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for (id, handle) in &self.connections {
            if Some(*id) == skip {
                continue;
            }
            match handle.outbound.try_send(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    log::warn!("Outbound queue full for connection {id}, dropping message");
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    // Writer already gone; its unregister is on the way.
                    log::debug!("Connection {id} closed before delivery");
                    report.dropped += 1;
                }
            }
        }

        self.counters
            .messages_sent
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.counters
            .messages_dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        report
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, id: &ConnId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn get(&self, id: &ConnId) -> Option<&ConnectionHandle<M, P>> {
        self.connections.get(id)
    }

    pub fn handles(&self) -> impl Iterator<Item = &ConnectionHandle<M, P>> {
        self.connections.values()
    }

    pub fn counters(&self) -> &Arc<RegistryCounters> {
        &self.counters
    }

    pub fn stats(&self) -> BroadcastStats {
        self.counters.snapshot()
    }
}

impl<M, P: Clone> Default for ConnectionRegistry<M, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M, P> Drop for ConnectionRegistry<M, P> {
    fn drop(&mut self) {
        let remaining = self.connections.len();
        if remaining > 0 {
            self.counters
                .active_connections
                .fetch_sub(remaining, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Registry = ConnectionRegistry<&'static str, Arc<Vec<u8>>>;

    fn payload(byte: u8) -> Arc<Vec<u8>> {
        Arc::new(vec![byte; 8])
    }

    #[tokio::test]
    async fn test_register_unregister_counts() {
        let mut registry = Registry::new();
        let (alice, _rx_a) = ConnectionHandle::new("alice", 4);
        let (bob, _rx_b) = ConnectionHandle::new("bob", 4);
        let alice_id = alice.id();

        registry.register(alice);
        registry.register(bob);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.stats().active_connections, 2);

        assert!(registry.unregister(&alice_id).is_some());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.stats().active_connections, 1);

        // Second unregister is a no-op
        assert!(registry.unregister(&alice_id).is_none());
        assert_eq!(registry.stats().active_connections, 1);
    }

    #[tokio::test]
    async fn test_membership_tracks_register_minus_unregister() {
        let mut registry = Registry::new();
        let mut ids = Vec::new();
        let mut receivers = Vec::new();
        let mut expected = 0usize;

        for i in 0..50 {
            if i % 3 == 2 {
                let id: ConnId = ids.remove(0);
                registry.unregister(&id);
                expected -= 1;
            } else {
                let (handle, rx) = ConnectionHandle::new("peer", 2);
                ids.push(handle.id());
                receivers.push(rx);
                registry.register(handle);
                expected += 1;
            }
            assert_eq!(registry.len(), expected);
            assert_eq!(registry.counters().active_connections(), expected);
        }
    }

    #[tokio::test]
    async fn test_unregister_closes_queue() {
        let mut registry = Registry::new();
        let (handle, mut rx) = ConnectionHandle::new("alice", 4);
        let id = handle.id();
        registry.register(handle);

        registry.broadcast(&payload(1), None);
        registry.unregister(&id);

        // Queued message still drains, then the queue reports closed
        assert_eq!(*rx.recv().await.unwrap(), vec![1; 8]);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_skips_origin() {
        let mut registry = Registry::new();
        let (alice, mut rx_a) = ConnectionHandle::new("alice", 4);
        let (bob, mut rx_b) = ConnectionHandle::new("bob", 4);
        let alice_id = alice.id();
        registry.register(alice);
        registry.register(bob);

        let report = registry.broadcast(&payload(7), Some(alice_id));
        assert_eq!(report, DeliveryReport { delivered: 1, dropped: 0 });
        assert!(rx_a.try_recv().is_err());
        assert_eq!(*rx_b.try_recv().unwrap(), vec![7; 8]);
    }

    #[tokio::test]
    async fn test_full_queue_drops_for_that_recipient_only() {
        let mut registry = Registry::new();
        let (slow, mut rx_slow) = ConnectionHandle::new("slow", 2);
        let (fast, mut rx_fast) = ConnectionHandle::new("fast", 16);
        registry.register(slow);
        registry.register(fast);

        let mut total = DeliveryReport::default();
        for i in 0..5u8 {
            let report = registry.broadcast(&payload(i), None);
            total.delivered += report.delivered;
            total.dropped += report.dropped;
        }

        // slow got 2 of 5, fast got all 5
        assert_eq!(total.delivered, 7);
        assert_eq!(total.dropped, 3);

        let mut slow_seen = Vec::new();
        while let Ok(p) = rx_slow.try_recv() {
            slow_seen.push(p[0]);
        }
        assert_eq!(slow_seen, vec![0, 1]);

        let mut fast_seen = Vec::new();
        while let Ok(p) = rx_fast.try_recv() {
            fast_seen.push(p[0]);
        }
        assert_eq!(fast_seen, vec![0, 1, 2, 3, 4]);

        let stats = registry.stats();
        assert_eq!(stats.messages_sent, 7);
        assert_eq!(stats.messages_dropped, 3);
    }

    #[tokio::test]
    async fn test_closed_receiver_counts_as_dropped() {
        let mut registry = Registry::new();
        let (handle, rx) = ConnectionHandle::new("gone", 4);
        assert!(handle.is_live());
        registry.register(handle);
        drop(rx);

        assert!(!registry.handles().next().unwrap().is_live());
        let report = registry.broadcast(&payload(1), None);
        assert_eq!(report, DeliveryReport { delivered: 0, dropped: 1 });
    }

    #[tokio::test]
    async fn test_shared_counters_across_registries() {
        let counters = Arc::new(RegistryCounters::default());
        let mut room_a: Registry = ConnectionRegistry::with_counters(counters.clone());
        let mut room_b: Registry = ConnectionRegistry::with_counters(counters.clone());

        let (a, _rx_a) = ConnectionHandle::new("a", 1);
        let (b, _rx_b) = ConnectionHandle::new("b", 1);
        room_a.register(a);
        room_b.register(b);
        assert_eq!(counters.active_connections(), 2);

        drop(room_b);
        assert_eq!(counters.active_connections(), 1);
    }
}
