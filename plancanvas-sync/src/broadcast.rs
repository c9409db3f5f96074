//! Fan-out of canonical changes to every peer on a canvas.
//!
//! One tokio broadcast channel per canvas; each peer holds an independent
//! receiver buffering up to `capacity` frames. Frames are encoded once and
//! shared behind an `Arc`, tagged with the peer whose mutation caused them so
//! connection tasks can skip their own changes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerFrame};

/// An encoded server frame and the peer it originated from.
#[derive(Debug)]
pub struct Envelope {
    pub origin: Uuid,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

#[derive(Debug)]
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    peers: RwLock<HashSet<Uuid>>,
    capacity: usize,
    /// Updated without taking the peers lock.
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashSet::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a peer and hand back its receiver, or `None` when the group
    /// already holds `max_peers` other peers. Re-adding a present peer
    /// replaces its receiver.
    pub async fn add_peer(
        &self,
        peer_id: Uuid,
        max_peers: usize,
    ) -> Option<broadcast::Receiver<Arc<Envelope>>> {
        let mut peers = self.peers.write().await;
        if !peers.contains(&peer_id) && peers.len() >= max_peers {
            return None;
        }
        peers.insert(peer_id);
        Some(self.sender.subscribe())
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode `frame` once and fan it out. Returns the number of receivers,
    /// including the origin's own.
    pub fn broadcast(&self, origin: Uuid, frame: &ServerFrame) -> Result<usize, ProtocolError> {
        let bytes = frame.encode()?;
        Ok(self.broadcast_raw(Arc::new(Envelope { origin, bytes })))
    }

    pub fn broadcast_raw(&self, envelope: Arc<Envelope>) -> usize {
        let count = self.sender.send(envelope).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plancanvas_core::{RemoteChange, SyncEvent};

    fn delete_frame(canvas: Uuid) -> ServerFrame {
        ServerFrame::event(canvas, SyncEvent::RemoteChange(RemoteChange::Delete("c-1".into())))
    }

    #[tokio::test]
    async fn test_add_remove_peer() {
        let group = BroadcastGroup::new(16);
        let peer = Uuid::new_v4();

        let _rx = group.add_peer(peer, 10).await.unwrap();
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&peer).await);

        assert!(group.remove_peer(&peer).await);
        assert!(!group.remove_peer(&peer).await);
        assert_eq!(group.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_max_peers() {
        let group = BroadcastGroup::new(16);
        let alice = Uuid::new_v4();
        let _a = group.add_peer(alice, 1).await.unwrap();

        assert!(group.add_peer(Uuid::new_v4(), 1).await.is_none());
        assert!(group.add_peer(alice, 1).await.is_some(), "rejoin is allowed");
    }

    #[tokio::test]
    async fn test_fan_out_carries_origin() {
        let group = BroadcastGroup::new(16);
        let canvas = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut rx_a = group.add_peer(alice, 10).await.unwrap();
        let mut rx_b = group.add_peer(bob, 10).await.unwrap();

        let count = group.broadcast(alice, &delete_frame(canvas)).unwrap();
        assert_eq!(count, 2);

        let for_alice = rx_a.recv().await.unwrap();
        let for_bob = rx_b.recv().await.unwrap();
        assert_eq!(for_alice.origin, alice);
        assert!(Arc::ptr_eq(&for_alice, &for_bob), "encoded once");
        assert_eq!(ServerFrame::decode(&for_bob.bytes).unwrap(), delete_frame(canvas));
    }

    #[tokio::test]
    async fn test_stats() {
        let group = BroadcastGroup::new(16);
        let peer = Uuid::new_v4();
        let _rx = group.add_peer(peer, 10).await.unwrap();

        group.broadcast(peer, &delete_frame(Uuid::new_v4())).unwrap();
        group.broadcast(peer, &delete_frame(Uuid::new_v4())).unwrap();
        group.record_dropped(3);

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(stats.active_peers, 1);
        assert_eq!(group.capacity(), 16);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let peer = Uuid::new_v4();
        let mut rx = group.add_peer(peer, 10).await.unwrap();

        for _ in 0..5 {
            group.broadcast(Uuid::new_v4(), &delete_frame(Uuid::new_v4())).unwrap();
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
    }
}
