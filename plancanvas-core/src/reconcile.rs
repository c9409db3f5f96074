//! Merging backend events into local state.
//!
//! Rules, per aspect id:
//!
//! - **Ack** confirms one send. Creates are rekeyed tentative → canonical in
//!   place. Newer local edits made while the send was in flight stay visible
//!   and go out as an update against the acknowledged revision.
//! - **Reject** rolls creates back and restores the last confirmed state for
//!   updates. Other aspects are untouched.
//! - **RemoteChange** is last-writer-wins by revision. A pending local edit is
//!   never overwritten; only the confirmed base beneath it advances.
//! - **Snapshot** rebuilds the store and re-layers pending work on top.
//!
//! Events for unknown correlations, stale sequences and stale revisions are
//! no-ops, so duplicate delivery is harmless.

use std::collections::HashSet;

use crate::error::SyncError;
use crate::event::{Mutation, MutationKind, MutationOp, RejectReason, RemoteChange, SyncEvent};
use crate::session::{CanvasSession, SyncNotice};
use crate::{AspectId, AspectPayload, CanvasAspect};

/// What applying one event produced.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Reconciliation {
    /// Mutations to publish now.
    pub outgoing: Vec<Mutation>,
    pub notices: Vec<SyncNotice>,
    /// Whether the store or pending set changed.
    pub changed: bool,
}

impl CanvasSession {
    /// Apply one canonical event.
    pub fn apply(&mut self, event: SyncEvent) -> Reconciliation {
        log::trace!("canvas {}: applying {}", self.canvas_id(), event.label());
        let before = self.version();
        let mut out = Reconciliation::default();

        match event {
            SyncEvent::Snapshot(aspects) => self.on_snapshot(aspects, &mut out),
            SyncEvent::Ack {
                correlation_id,
                seq,
                aspect,
            } => self.on_ack(&correlation_id, seq, aspect, &mut out),
            SyncEvent::Reject {
                correlation_id,
                seq,
                reason,
            } => self.on_reject(&correlation_id, seq, &reason, &mut out),
            SyncEvent::RemoteChange(change) => self.on_remote_change(change, &mut out),
        }

        out.changed = self.version() != before;
        out
    }

    /// Pending entry id for (`correlation_id`, `seq`), if that exact send is
    /// the one in flight.
    fn in_flight_for(&self, correlation_id: &AspectId, seq: u64) -> Option<AspectId> {
        let id = self.pending.resolve(correlation_id)?;
        let entry = self.pending.get(id)?;
        if entry.in_flight.seq != seq {
            log::debug!(
                "ignoring answer for {correlation_id} seq {seq}; seq {} is in flight",
                entry.in_flight.seq
            );
            return None;
        }
        Some(id.clone())
    }

    fn on_ack(
        &mut self,
        correlation_id: &AspectId,
        seq: u64,
        aspect: Option<CanvasAspect>,
        out: &mut Reconciliation,
    ) {
        if self.pending.resolve(correlation_id).is_none() {
            if self.deletes.settle(correlation_id, seq).is_some() {
                log::debug!("delete of {correlation_id} acknowledged");
            } else {
                log::debug!("{}; ack ignored", SyncError::UnknownId(correlation_id.clone()));
            }
            return;
        }
        let Some(id) = self.in_flight_for(correlation_id, seq) else {
            return;
        };
        let Some(canonical) = aspect else {
            let error = SyncError::Protocol(format!(
                "ack for {correlation_id} seq {seq} carried no aspect"
            ));
            self.roll_back(id, false, error, out);
            return;
        };

        let visible = self.store.get_by_id(&id).map(|a| a.payload.clone());
        let shown = self.settle_confirmed(&id, canonical, visible, out);
        log::debug!("ack: {id} confirmed as {} r{:?}", shown.id, shown.revision);
        self.store.rekey(&id, shown);
    }

    fn on_reject(
        &mut self,
        correlation_id: &AspectId,
        seq: u64,
        reason: &RejectReason,
        out: &mut Reconciliation,
    ) {
        if self.pending.resolve(correlation_id).is_none() {
            if self.deletes.settle(correlation_id, seq).is_some() {
                let error = SyncError::from_reject(correlation_id, reason);
                log::warn!("delete of {correlation_id} rejected: {error}");
                out.notices.push(SyncNotice::Rejected {
                    id: correlation_id.clone(),
                    kind: MutationKind::Delete,
                    error,
                });
            } else {
                log::debug!("{}; reject ignored", SyncError::UnknownId(correlation_id.clone()));
            }
            return;
        }
        let Some(id) = self.in_flight_for(correlation_id, seq) else {
            return;
        };
        let error = SyncError::from_reject(&id, reason);
        let gone = matches!(reason, RejectReason::NotFound);
        self.roll_back(id, gone, error, out);
    }

    /// Drop the pending entry at `id` and restore its last confirmed state.
    /// When the backend no longer has the aspect (`gone`), or never
    /// confirmed it, the aspect is removed instead.
    fn roll_back(&mut self, id: AspectId, gone: bool, error: SyncError, out: &mut Reconciliation) {
        let Some(entry) = self.pending.remove(&id) else {
            return;
        };

        let kind = entry.kind();
        match entry.base {
            Some(base) if !gone && kind != MutationKind::Create => {
                self.store.rekey(&id, base);
            }
            _ => {
                self.store.remove(&id);
            }
        }

        log::warn!("{kind:?} of {id} rejected: {error}");
        out.notices.push(SyncNotice::Rejected { id, kind, error });
    }

    fn on_remote_change(&mut self, change: RemoteChange, out: &mut Reconciliation) {
        let aspect = match change {
            RemoteChange::Delete(id) => {
                self.store.remove(&id);
                if self.pending.remove(&id).is_some() {
                    log::info!("remote delete of {id} discarded a pending local edit");
                }
                return;
            }
            RemoteChange::Upsert(aspect) => aspect,
        };

        let Some(revision) = aspect.revision else {
            log::warn!("remote change for {} has no revision; ignored", aspect.id);
            return;
        };
        if self.deletes.is_tombstoned(&aspect) {
            log::debug!("remote change for locally deleted {} ignored", aspect.id);
            return;
        }

        // Our own create echoed back before its Ack.
        if let Some(tentative) = self.pending_create_for(&aspect) {
            let visible = self.store.get_by_id(&tentative).map(|a| a.payload.clone());
            let shown = self.settle_confirmed(&tentative, aspect, visible, out);
            self.store.rekey(&tentative, shown);
            return;
        }

        if let Some(entry) = self.pending.get(&aspect.id) {
            if entry.base_revision().is_none_or(|base| revision > base) {
                log::debug!(
                    "remote r{revision} for {} becomes base under pending edit",
                    aspect.id
                );
                let id = aspect.id.clone();
                self.pending.set_base(&id, aspect);
            } else {
                log::debug!("stale remote r{revision} for pending {} ignored", aspect.id);
            }
            return;
        }

        match self.store.revision_of(&aspect.id) {
            Some(stored) if revision <= stored => {
                log::debug!("stale remote r{revision} for {} (have r{stored})", aspect.id);
            }
            _ => self.store.upsert(aspect),
        }
    }

    fn on_snapshot(&mut self, aspects: Vec<CanvasAspect>, out: &mut Reconciliation) {
        let previous = self.store.get_all();
        let mut placed: HashSet<AspectId> = HashSet::with_capacity(aspects.len());
        let mut rebuilt = Vec::with_capacity(aspects.len() + self.pending.len());

        for aspect in aspects {
            if self.deletes.is_tombstoned(&aspect) {
                continue;
            }
            if let Some(tentative) = self.pending_create_for(&aspect) {
                let visible = self.store.get_by_id(&tentative).map(|a| a.payload.clone());
                let shown = self.settle_confirmed(&tentative, aspect, visible, out);
                placed.insert(tentative);
                placed.insert(shown.id.clone());
                rebuilt.push(shown);
                continue;
            }
            if self.pending.contains(&aspect.id) {
                let visible = self.store.get_by_id(&aspect.id).cloned();
                let id = aspect.id.clone();
                self.pending.set_base(&id, aspect.clone());
                placed.insert(id);
                rebuilt.push(visible.unwrap_or(aspect));
                continue;
            }
            placed.insert(aspect.id.clone());
            rebuilt.push(aspect);
        }

        // Pending work the backend has not seen keeps its relative order.
        // Whatever base it had is gone from the backend.
        for aspect in previous {
            if placed.contains(&aspect.id) || !self.pending.contains(&aspect.id) {
                continue;
            }
            self.pending.clear_base(&aspect.id);
            rebuilt.push(aspect);
        }
        self.store.reset(rebuilt);

        out.outgoing = self.outstanding();
        log::info!(
            "canvas {}: snapshot applied, {} aspects, republishing {}",
            self.canvas_id(),
            self.store.len(),
            out.outgoing.len()
        );
        out.notices.push(SyncNotice::Resynced {
            republished: out.outgoing.len(),
        });
    }

    /// Tentative id of the pending create `aspect` was minted from.
    fn pending_create_for(&self, aspect: &CanvasAspect) -> Option<AspectId> {
        let origin = aspect.origin.as_ref()?;
        let id = self.pending.resolve(origin)?;
        let entry = self.pending.get(id)?;
        (entry.kind() == MutationKind::Create).then(|| id.clone())
    }

    /// Resolve the pending entry at `id` against confirmed `canonical` and
    /// return the aspect that should be visible in its place.
    fn settle_confirmed(
        &mut self,
        id: &AspectId,
        canonical: CanvasAspect,
        visible: Option<AspectPayload>,
        out: &mut Reconciliation,
    ) -> CanvasAspect {
        let Some(entry) = self.pending.get(id).cloned() else {
            return canonical;
        };
        if *id != canonical.id {
            out.notices.push(SyncNotice::Confirmed {
                tentative: id.clone(),
                id: canonical.id.clone(),
            });
        }
        if !entry.has_newer_edits() {
            self.pending.remove(id);
            return canonical;
        }

        let payload = visible.unwrap_or_else(|| canonical.payload.clone());
        if *id != canonical.id {
            self.pending.rekey(id, canonical.id.clone());
        }
        let next = Mutation {
            correlation_id: canonical.id.clone(),
            seq: entry.local_seq,
            op: MutationOp::Update {
                id: canonical.id.clone(),
                base_revision: canonical.revision.unwrap_or_default(),
                payload: payload.clone(),
            },
        };
        self.pending.set_base(&canonical.id, canonical.clone());
        self.pending.send_next(&canonical.id, next.clone());
        log::debug!(
            "{} confirmed with newer local edits; sending seq {}",
            canonical.id,
            next.seq
        );
        out.outgoing.push(next);
        CanvasAspect { payload, ..canonical }
    }
}
