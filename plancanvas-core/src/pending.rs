//! Local work the backend has not confirmed yet.
//!
//! [`PendingSet`] tracks creates and updates by the id the aspect currently
//! has in the store; [`DeleteOutbox`] tracks deletes, whose ids are already
//! gone from the store.

use std::collections::{HashMap, HashSet};

use crate::event::{Mutation, MutationKind};
use crate::{AspectId, CanvasAspect, Revision};

/// Unconfirmed state for one aspect.
///
/// At most one mutation per aspect is in flight. Newer local edits only bump
/// `local_seq`; they are sent once the in-flight one is acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    /// The mutation currently awaiting Ack/Reject, republished verbatim on
    /// reconnect.
    pub in_flight: Mutation,
    /// Sequence of the newest local edit to this aspect.
    pub local_seq: u64,
    /// Last confirmed backend state the pending edit is layered on.
    pub base: Option<CanvasAspect>,
}

impl PendingEntry {
    pub fn new(in_flight: Mutation, base: Option<CanvasAspect>) -> Self {
        Self {
            local_seq: in_flight.seq,
            in_flight,
            base,
        }
    }

    pub fn correlation_id(&self) -> &AspectId {
        &self.in_flight.correlation_id
    }

    pub fn kind(&self) -> MutationKind {
        self.in_flight.kind()
    }

    /// Local edits made after the in-flight mutation was sent.
    pub fn has_newer_edits(&self) -> bool {
        self.local_seq > self.in_flight.seq
    }

    pub fn base_revision(&self) -> Option<Revision> {
        self.base.as_ref().and_then(|b| b.revision)
    }
}

/// Ids awaiting backend confirmation, with a correlation index.
#[derive(Debug, Default, Clone)]
pub struct PendingSet {
    entries: HashMap<AspectId, PendingEntry>,
    /// correlation id → id the aspect currently has in the store
    by_correlation: HashMap<AspectId, AspectId>,
    version: u64,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: AspectId, entry: PendingEntry) {
        if let Some(old) = self.entries.remove(&id) {
            self.by_correlation.remove(old.correlation_id());
        }
        self.by_correlation.insert(entry.correlation_id().clone(), id.clone());
        self.entries.insert(id, entry);
        self.version += 1;
    }

    pub fn remove(&mut self, id: &AspectId) -> Option<PendingEntry> {
        let entry = self.entries.remove(id)?;
        self.by_correlation.remove(entry.correlation_id());
        self.version += 1;
        Some(entry)
    }

    /// Move an entry to a new store id, keeping its correlation.
    pub fn rekey(&mut self, old: &AspectId, new: AspectId) -> bool {
        let Some(entry) = self.entries.remove(old) else {
            return false;
        };
        self.by_correlation.insert(entry.correlation_id().clone(), new.clone());
        self.entries.insert(new, entry);
        self.version += 1;
        true
    }

    /// Record a newer local edit.
    pub fn touch(&mut self, id: &AspectId, seq: u64) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        entry.local_seq = entry.local_seq.max(seq);
        self.version += 1;
        true
    }

    /// Replace the in-flight mutation, re-indexing its correlation.
    pub fn send_next(&mut self, id: &AspectId, mutation: Mutation) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        self.by_correlation.remove(&entry.in_flight.correlation_id);
        self.by_correlation.insert(mutation.correlation_id.clone(), id.clone());
        entry.local_seq = entry.local_seq.max(mutation.seq);
        entry.in_flight = mutation;
        self.version += 1;
        true
    }

    /// Advance the confirmed base under a pending edit.
    pub fn set_base(&mut self, id: &AspectId, base: CanvasAspect) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        entry.base = Some(base);
        self.version += 1;
        true
    }

    /// Forget the confirmed base, e.g. when the backend no longer has it.
    pub fn clear_base(&mut self, id: &AspectId) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) if entry.base.is_some() => {
                entry.base = None;
                self.version += 1;
                true
            }
            _ => false,
        }
    }

    /// Store id currently tracked under `correlation_id`.
    pub fn resolve(&self, correlation_id: &AspectId) -> Option<&AspectId> {
        self.by_correlation.get(correlation_id)
    }

    pub fn get(&self, id: &AspectId) -> Option<&PendingEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &AspectId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &AspectId> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AspectId, &PendingEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Deletes sent but not yet acknowledged.
///
/// Ids here are tombstoned: a racing remote upsert for them is ignored until
/// the backend answers the delete.
#[derive(Debug, Default, Clone)]
pub struct DeleteOutbox {
    queue: Vec<Mutation>,
    tombstones: HashSet<AspectId>,
}

impl DeleteOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: AspectId, mutation: Mutation) {
        self.tombstones.insert(id);
        self.queue.push(mutation);
    }

    /// Drop the delete answered by (`correlation_id`, `seq`).
    pub fn settle(&mut self, correlation_id: &AspectId, seq: u64) -> Option<Mutation> {
        let pos = self
            .queue
            .iter()
            .position(|m| m.correlation_id == *correlation_id && m.seq == seq)?;
        let mutation = self.queue.remove(pos);
        self.tombstones.remove(correlation_id);
        Some(mutation)
    }

    /// Whether `aspect` was deleted locally (by id or by the tentative id it
    /// was created from).
    pub fn is_tombstoned(&self, aspect: &CanvasAspect) -> bool {
        self.tombstones.contains(&aspect.id)
            || aspect
                .origin
                .as_ref()
                .is_some_and(|o| self.tombstones.contains(o))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mutation> {
        self.queue.iter()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
