//! Authoritative canvas state held by the reference backend.
//!
//! The ledger is what the client reconciles against: it mints canonical ids,
//! keeps one monotonically increasing revision per aspect, refuses stale
//! writes and answers a republished mutation with the answer it already gave.

use std::collections::{HashMap, VecDeque};

use plancanvas_core::{
    AspectId, AspectPayload, CanvasAspect, EntityStore, Mutation, MutationOp, RejectReason,
    RemoteChange, Revision, SyncEvent,
};
use uuid::Uuid;

/// Answers remembered for republished mutations.
const ANSWER_CACHE_LIMIT: usize = 4096;

/// Tentative ids remembered for create deduplication. A create republished
/// after this many newer creates is treated as new.
const MINTED_LIMIT: usize = 4 * ANSWER_CACHE_LIMIT;

/// Result of applying one mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// Ack or Reject for the originating peer.
    pub reply: SyncEvent,
    /// Change to fan out to every other peer.
    pub change: Option<RemoteChange>,
}

impl Applied {
    fn reject(mutation: &Mutation, reason: RejectReason) -> Self {
        Self {
            reply: SyncEvent::Reject {
                correlation_id: mutation.correlation_id.clone(),
                seq: mutation.seq,
                reason,
            },
            change: None,
        }
    }

    fn ack(mutation: &Mutation, aspect: Option<CanvasAspect>, change: Option<RemoteChange>) -> Self {
        Self {
            reply: SyncEvent::Ack {
                correlation_id: mutation.correlation_id.clone(),
                seq: mutation.seq,
                aspect,
            },
            change,
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self.reply, SyncEvent::Ack { .. })
    }
}

#[derive(Debug)]
pub struct CanvasLedger {
    canvas_id: Uuid,
    store: EntityStore,
    next_id: u64,
    /// tentative id → canonical id
    minted: HashMap<AspectId, AspectId>,
    minted_order: VecDeque<AspectId>,
    answers: HashMap<(Uuid, u64), Applied>,
    answer_order: VecDeque<(Uuid, u64)>,
}

impl CanvasLedger {
    pub fn new(canvas_id: Uuid) -> Self {
        Self {
            canvas_id,
            store: EntityStore::new(),
            next_id: 1,
            minted: HashMap::new(),
            minted_order: VecDeque::new(),
            answers: HashMap::new(),
            answer_order: VecDeque::new(),
        }
    }

    pub fn canvas_id(&self) -> Uuid {
        self.canvas_id
    }

    /// Full ordered state.
    pub fn snapshot(&self) -> SyncEvent {
        SyncEvent::Snapshot(self.store.get_all())
    }

    pub fn get(&self, id: &AspectId) -> Option<&CanvasAspect> {
        self.store.get_by_id(self.resolve(id))
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Apply `mutation` from `peer_id`. A `(peer_id, seq)` pair seen before
    /// gets its original answer back, brought up to date with the aspect as
    /// it is now, and no second broadcast.
    pub fn apply(&mut self, peer_id: Uuid, mutation: &Mutation) -> Applied {
        let key = (peer_id, mutation.seq);
        if let Some(previous) = self.answers.get(&key) {
            log::debug!(
                "canvas {}: replaying answer for {} seq {}",
                self.canvas_id,
                mutation.correlation_id,
                mutation.seq
            );
            return Applied {
                reply: self.current_answer(mutation, &previous.reply),
                change: None,
            };
        }

        let applied = match &mutation.op {
            MutationOp::Create { payload } => self.create(mutation, payload),
            MutationOp::Update {
                id,
                base_revision,
                payload,
            } => self.update(mutation, id, *base_revision, payload),
            MutationOp::Delete { id } => {
                let id = self.resolve(id).clone();
                match self.store.remove(&id) {
                    Some(_) => Applied::ack(mutation, None, Some(RemoteChange::Delete(id))),
                    // Already gone: deletes are idempotent.
                    None => Applied::ack(mutation, None, None),
                }
            }
        };

        if applied.is_ack() {
            log::debug!(
                "canvas {}: {:?} {} accepted",
                self.canvas_id,
                mutation.kind(),
                mutation.correlation_id
            );
        } else {
            log::info!(
                "canvas {}: {:?} {} rejected",
                self.canvas_id,
                mutation.kind(),
                mutation.correlation_id
            );
        }
        self.remember(key, applied.clone());
        applied
    }

    fn create(&mut self, mutation: &Mutation, payload: &AspectPayload) -> Applied {
        if let Err(reason) = payload.validate() {
            return Applied::reject(mutation, RejectReason::Validation(reason));
        }
        if let Some(id) = self.minted.get(&mutation.correlation_id) {
            // Applied before; the aspect may have been deleted since.
            return match self.store.get_by_id(id) {
                Some(existing) => Applied::ack(mutation, Some(existing.clone()), None),
                None => Applied::reject(mutation, RejectReason::NotFound),
            };
        }

        let id = self.mint();
        let aspect = CanvasAspect::canonical(id.clone(), 1, payload.clone())
            .with_origin(mutation.correlation_id.clone());
        self.remember_minted(mutation.correlation_id.clone(), id);
        self.store.upsert(aspect.clone());
        Applied::ack(
            mutation,
            Some(aspect.clone()),
            Some(RemoteChange::Upsert(aspect)),
        )
    }

    fn update(
        &mut self,
        mutation: &Mutation,
        id: &AspectId,
        base_revision: Revision,
        payload: &AspectPayload,
    ) -> Applied {
        let id = self.resolve(id).clone();
        let Some(current) = self.store.get_by_id(&id) else {
            return Applied::reject(mutation, RejectReason::NotFound);
        };
        if let Err(reason) = payload.validate() {
            return Applied::reject(mutation, RejectReason::Validation(reason));
        }
        let revision = current.revision.unwrap_or_default();
        if revision != base_revision {
            return Applied::reject(
                mutation,
                RejectReason::Conflict {
                    current: Some(revision),
                },
            );
        }
        let aspect = CanvasAspect {
            revision: Some(revision + 1),
            payload: payload.clone(),
            ..current.clone()
        };
        self.store.upsert(aspect.clone());
        Applied::ack(
            mutation,
            Some(aspect.clone()),
            Some(RemoteChange::Upsert(aspect)),
        )
    }

    fn mint(&mut self) -> AspectId {
        let id = AspectId::new(format!("c-{}", self.next_id));
        self.next_id += 1;
        id
    }

    /// Canonical id for `id`, following tentative ids this ledger minted for.
    fn resolve<'a>(&'a self, id: &'a AspectId) -> &'a AspectId {
        self.minted.get(id).unwrap_or(id)
    }

    /// A remembered answer as it stands now: an Ack never hands out an aspect
    /// the ledger has since changed or deleted.
    fn current_answer(&self, mutation: &Mutation, reply: &SyncEvent) -> SyncEvent {
        let SyncEvent::Ack {
            aspect: Some(acked), ..
        } = reply
        else {
            return reply.clone();
        };
        match self.store.get_by_id(&acked.id) {
            Some(current) => SyncEvent::Ack {
                correlation_id: mutation.correlation_id.clone(),
                seq: mutation.seq,
                aspect: Some(current.clone()),
            },
            None => Applied::reject(mutation, RejectReason::NotFound).reply,
        }
    }

    fn remember_minted(&mut self, tentative: AspectId, canonical: AspectId) {
        if self.minted.insert(tentative.clone(), canonical).is_none() {
            self.minted_order.push_back(tentative);
        }
        while self.minted_order.len() > MINTED_LIMIT {
            if let Some(oldest) = self.minted_order.pop_front() {
                self.minted.remove(&oldest);
            }
        }
    }

    fn remember(&mut self, key: (Uuid, u64), applied: Applied) {
        if self.answers.insert(key, applied).is_none() {
            self.answer_order.push_back(key);
        }
        while self.answer_order.len() > ANSWER_CACHE_LIMIT {
            if let Some(oldest) = self.answer_order.pop_front() {
                self.answers.remove(&oldest);
            }
        }
    }
}
