//! The per-subscription session object.
//!
//! A `CanvasSession` is created when a canvas is subscribed and dropped when
//! it is unsubscribed. It exclusively owns the [`EntityStore`], the
//! [`PendingSet`] and the [`DeleteOutbox`]; readers go through
//! [`crate::Selectors`], writers through the intent methods below or through
//! [`CanvasSession::apply`] for backend events.

use uuid::Uuid;

use crate::error::SyncError;
use crate::event::{Mutation, MutationKind, MutationOp};
use crate::pending::{DeleteOutbox, PendingEntry, PendingSet};
use crate::store::EntityStore;
use crate::{AspectId, AspectPayload, CanvasAspect};

/// User-visible outcome of reconciliation or transport activity.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotice {
    /// A tentative aspect received its canonical id.
    Confirmed { tentative: AspectId, id: AspectId },
    /// A mutation was refused; local state has been rolled back.
    Rejected {
        id: AspectId,
        kind: MutationKind,
        error: SyncError,
    },
    /// Connection dropped; pending work is kept.
    ConnectionLost,
    /// Snapshot applied after (re)connect and pending work republished.
    Resynced { republished: usize },
}

#[derive(Debug)]
pub struct CanvasSession {
    canvas_id: Uuid,
    pub(crate) store: EntityStore,
    pub(crate) pending: PendingSet,
    pub(crate) deletes: DeleteOutbox,
    next_seq: u64,
}

impl CanvasSession {
    pub fn new(canvas_id: Uuid) -> Self {
        Self {
            canvas_id,
            store: EntityStore::new(),
            pending: PendingSet::new(),
            deletes: DeleteOutbox::new(),
            next_seq: 1,
        }
    }

    pub fn canvas_id(&self) -> Uuid {
        self.canvas_id
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn pending(&self) -> &PendingSet {
        &self.pending
    }

    pub fn deletes(&self) -> &DeleteOutbox {
        &self.deletes
    }

    /// Combined version of store and pending set; changes on every mutation
    /// of either.
    pub fn version(&self) -> u64 {
        self.store.version() + self.pending.version()
    }

    pub(crate) fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Optimistically create an aspect under a fresh tentative id.
    pub fn create(&mut self, payload: AspectPayload) -> (AspectId, Mutation) {
        let id = AspectId::tentative();
        let mutation = self.create_with_id(id.clone(), payload);
        (id, mutation)
    }

    /// Like [`create`](Self::create) with a caller-chosen tentative id.
    pub fn create_with_id(&mut self, id: AspectId, payload: AspectPayload) -> Mutation {
        let mutation = Mutation {
            correlation_id: id.clone(),
            seq: self.next_seq(),
            op: MutationOp::Create {
                payload: payload.clone(),
            },
        };
        self.store.upsert(CanvasAspect::tentative(id.clone(), payload));
        self.pending.insert(id, PendingEntry::new(mutation.clone(), None));
        log::debug!("local create {} (seq {})", mutation.correlation_id, mutation.seq);
        mutation
    }

    /// Optimistically replace an aspect's payload.
    ///
    /// Returns the mutation to send, or `None` when an earlier mutation for
    /// the same aspect is still in flight; the edit then goes out once that
    /// one is acknowledged.
    pub fn update(
        &mut self,
        id: &AspectId,
        payload: AspectPayload,
    ) -> Result<Option<Mutation>, SyncError> {
        let current = self
            .store
            .get_by_id(id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownId(id.clone()))?;
        let visible = CanvasAspect {
            payload: payload.clone(),
            ..current.clone()
        };
        let seq = self.next_seq();

        if self.pending.contains(id) {
            self.store.upsert(visible);
            self.pending.touch(id, seq);
            log::debug!("local update {id} coalesced behind in-flight send (seq {seq})");
            return Ok(None);
        }

        // Confirmed aspects always carry a revision.
        let base = current;
        let base_revision = base.revision.unwrap_or_default();
        let mutation = Mutation {
            correlation_id: id.clone(),
            seq,
            op: MutationOp::Update {
                id: id.clone(),
                base_revision,
                payload,
            },
        };
        self.store.upsert(visible);
        self.pending
            .insert(id.clone(), PendingEntry::new(mutation.clone(), Some(base)));
        log::debug!("local update {id} on revision {base_revision} (seq {seq})");
        Ok(Some(mutation))
    }

    /// Delete an aspect locally. Removal is unconditional; the returned
    /// delete is tracked until acknowledged.
    pub fn delete(&mut self, id: &AspectId) -> Result<Mutation, SyncError> {
        if self.store.remove(id).is_none() {
            return Err(SyncError::UnknownId(id.clone()));
        }
        // A create still in flight is addressed by its tentative id; the
        // backend resolves it through its correlation map.
        let target = match self.pending.remove(id) {
            Some(entry) if entry.kind() == MutationKind::Create => {
                entry.correlation_id().clone()
            }
            _ => id.clone(),
        };
        let mutation = Mutation {
            correlation_id: target.clone(),
            seq: self.next_seq(),
            op: MutationOp::Delete { id: target.clone() },
        };
        self.deletes.push(target, mutation.clone());
        log::debug!("local delete {id} (seq {})", mutation.seq);
        Ok(mutation)
    }

    /// Every mutation still awaiting an answer, in canvas order, followed by
    /// unacknowledged deletes. Exactly one mutation per pending entry.
    pub fn outstanding(&self) -> Vec<Mutation> {
        self.store
            .ids()
            .iter()
            .filter_map(|id| self.pending.get(id))
            .map(|entry| entry.in_flight.clone())
            .chain(self.deletes.iter().cloned())
            .collect()
    }
}
