//! Canvas rooms: one ledger and one broadcast group per canvas.
//!
//! ```text
//! peer A ──┐                         ┌──► peer B
//!          ├──► CanvasRoom ──► BroadcastGroup
//! peer B ──┘      │                  └──► peer C
//!                 └── Mutex<CanvasLedger>
//! ```
//!
//! Fan-out happens while the ledger lock is held, so every receiver sees
//! changes in the order the ledger applied them, and a peer joining gets a
//! snapshot that lines up exactly with the first change it will receive.

use std::collections::HashMap;
use std::sync::Arc;

use plancanvas_core::{Mutation, SyncEvent};
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, BroadcastStats, Envelope};
use crate::ledger::CanvasLedger;
use crate::protocol::{ProtocolError, ServerFrame};

#[derive(Debug)]
pub struct CanvasRoom {
    canvas_id: Uuid,
    group: BroadcastGroup,
    ledger: Mutex<CanvasLedger>,
}

/// What a peer gets when it joins: the current state and the stream of
/// everything after it.
pub struct Joined {
    pub snapshot: SyncEvent,
    pub receiver: broadcast::Receiver<Arc<Envelope>>,
}

impl CanvasRoom {
    pub fn new(canvas_id: Uuid, broadcast_capacity: usize) -> Self {
        Self {
            canvas_id,
            group: BroadcastGroup::new(broadcast_capacity),
            ledger: Mutex::new(CanvasLedger::new(canvas_id)),
        }
    }

    pub fn canvas_id(&self) -> Uuid {
        self.canvas_id
    }

    /// Subscribe `peer_id`. `None` when the room is full.
    pub async fn join(&self, peer_id: Uuid, max_peers: usize) -> Option<Joined> {
        let ledger = self.ledger.lock().await;
        let receiver = self.group.add_peer(peer_id, max_peers).await?;
        Some(Joined {
            snapshot: ledger.snapshot(),
            receiver,
        })
    }

    pub async fn leave(&self, peer_id: &Uuid) -> bool {
        self.group.remove_peer(peer_id).await
    }

    /// Current state, for peers whose receiver lagged.
    pub async fn snapshot(&self) -> SyncEvent {
        self.ledger.lock().await.snapshot()
    }

    /// Apply a mutation and fan the resulting change out to the other peers.
    /// Returns the Ack or Reject for the originator.
    pub async fn submit(
        &self,
        peer_id: Uuid,
        mutation: &Mutation,
    ) -> Result<SyncEvent, ProtocolError> {
        let mut ledger = self.ledger.lock().await;
        let applied = ledger.apply(peer_id, mutation);
        if let Some(change) = applied.change {
            let frame = ServerFrame::event(self.canvas_id, SyncEvent::RemoteChange(change));
            let receivers = self.group.broadcast(peer_id, &frame)?;
            log::trace!("canvas {}: change fanned out to {receivers} receivers", self.canvas_id);
        }
        Ok(applied.reply)
    }

    pub fn record_dropped(&self, n: u64) {
        self.group.record_dropped(n);
    }

    pub async fn peer_count(&self) -> usize {
        self.group.peer_count().await
    }

    pub async fn stats(&self) -> BroadcastStats {
        self.group.stats().await
    }

    pub async fn aspect_count(&self) -> usize {
        self.ledger.lock().await.len()
    }
}

/// Maps canvas ids to rooms. Rooms outlive their peers so a canvas keeps its
/// contents across reconnects.
#[derive(Debug)]
pub struct RoomManager {
    rooms: RwLock<HashMap<Uuid, Arc<CanvasRoom>>>,
    broadcast_capacity: usize,
}

impl RoomManager {
    pub fn new(broadcast_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            broadcast_capacity,
        }
    }

    pub async fn get_or_create(&self, canvas_id: Uuid) -> Arc<CanvasRoom> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&canvas_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Another connection may have created it in between.
        if let Some(room) = rooms.get(&canvas_id) {
            return room.clone();
        }
        log::info!("opening room for canvas {canvas_id}");
        let room = Arc::new(CanvasRoom::new(canvas_id, self.broadcast_capacity));
        rooms.insert(canvas_id, room.clone());
        room
    }

    pub async fn get(&self, canvas_id: &Uuid) -> Option<Arc<CanvasRoom>> {
        self.rooms.read().await.get(canvas_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_canvases(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().copied().collect()
    }
}
