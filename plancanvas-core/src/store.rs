//! Ordered, id-keyed storage of canvas aspects.
//!
//! The id → aspect map and the insertion order are kept separately;
//! z-ordering on the canvas depends on order, not just membership.

use std::collections::HashMap;

use crate::{AspectId, CanvasAspect, Revision};

/// Client-local source of truth for the canvas contents.
#[derive(Debug, Default, Clone)]
pub struct EntityStore {
    aspects: HashMap<AspectId, CanvasAspect>,
    order: Vec<AspectId>,
    /// Bumped on every mutation; drives selector invalidation.
    version: u64,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from an ordered sequence. Later duplicates replace
    /// earlier ones in place.
    pub fn from_aspects(aspects: impl IntoIterator<Item = CanvasAspect>) -> Self {
        let mut store = Self::new();
        for aspect in aspects {
            store.upsert(aspect);
        }
        store
    }

    /// Insert at the end if absent, replace in place if present.
    pub fn upsert(&mut self, aspect: CanvasAspect) {
        if !self.aspects.contains_key(&aspect.id) {
            self.order.push(aspect.id.clone());
        }
        self.aspects.insert(aspect.id.clone(), aspect);
        self.version += 1;
    }

    /// Remove an aspect. Absent ids are a no-op.
    pub fn remove(&mut self, id: &AspectId) -> Option<CanvasAspect> {
        let removed = self.aspects.remove(id)?;
        self.order.retain(|o| o != id);
        self.version += 1;
        Some(removed)
    }

    /// Replace the entry at `old`'s position with `aspect`, which may carry a
    /// different id. Any other entry already holding `aspect.id` is dropped so
    /// one logical aspect never appears twice. Returns `false` when `old` is
    /// absent (nothing changes).
    pub fn rekey(&mut self, old: &AspectId, aspect: CanvasAspect) -> bool {
        let Some(pos) = self.order.iter().position(|o| o == old) else {
            return false;
        };
        self.aspects.remove(old);
        if aspect.id != *old && self.aspects.remove(&aspect.id).is_some() {
            self.order.retain(|o| o != &aspect.id);
        }
        // Position may have shifted if the duplicate sat before it.
        let pos = self.order.iter().position(|o| o == old).unwrap_or(pos);
        self.order[pos] = aspect.id.clone();
        self.aspects.insert(aspect.id.clone(), aspect);
        self.version += 1;
        true
    }

    /// Swap the whole contents, keeping the version monotonic.
    pub fn reset(&mut self, aspects: impl IntoIterator<Item = CanvasAspect>) {
        let version = self.version;
        *self = Self::from_aspects(aspects);
        self.version = version + 1;
    }

    pub fn get_by_id(&self, id: &AspectId) -> Option<&CanvasAspect> {
        self.aspects.get(id)
    }

    /// All aspects in insertion order.
    pub fn get_all(&self) -> Vec<CanvasAspect> {
        self.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CanvasAspect> {
        self.order.iter().filter_map(|id| self.aspects.get(id))
    }

    pub fn ids(&self) -> &[AspectId] {
        &self.order
    }

    pub fn contains(&self, id: &AspectId) -> bool {
        self.aspects.contains_key(id)
    }

    pub fn revision_of(&self, id: &AspectId) -> Option<Revision> {
        self.aspects.get(id).and_then(|a| a.revision)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}
