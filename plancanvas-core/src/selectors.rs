//! Memoized read-only views over a [`CanvasSession`].
//!
//! Caches are keyed on the session's version counters rather than on
//! reference identity; a view is rebuilt only when the counter it depends
//! on has moved.

use std::sync::Arc;

use uuid::Uuid;

use crate::session::CanvasSession;
use crate::{AspectId, CanvasAspect};

/// Immutable snapshot handed to the rendering layer.
#[derive(Debug, Clone)]
pub struct CanvasView {
    pub canvas_id: Uuid,
    pub version: u64,
    /// All aspects in canvas order.
    pub aspects: Arc<[CanvasAspect]>,
    /// Subsequence of `aspects` awaiting backend confirmation.
    pub pending: Arc<[CanvasAspect]>,
}

impl CanvasView {
    pub fn empty(canvas_id: Uuid) -> Self {
        Self {
            canvas_id,
            version: 0,
            aspects: Arc::from(Vec::new()),
            pending: Arc::from(Vec::new()),
        }
    }

    pub fn get(&self, id: &AspectId) -> Option<&CanvasAspect> {
        self.aspects.iter().find(|a| &a.id == id)
    }

    pub fn is_pending(&self, id: &AspectId) -> bool {
        self.pending.iter().any(|a| &a.id == id)
    }

    pub fn len(&self) -> usize {
        self.aspects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aspects.is_empty()
    }
}

#[derive(Debug)]
struct Cached {
    version: u64,
    value: Arc<[CanvasAspect]>,
}

/// Version-keyed selector caches for one session.
#[derive(Debug, Default)]
pub struct Selectors {
    all: Option<Cached>,
    pending: Option<Cached>,
    /// Number of times a cached view had to be rebuilt.
    recomputations: u64,
}

impl Selectors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every aspect in canvas order. Rebuilt only when the store changed.
    pub fn all_aspects(&mut self, session: &CanvasSession) -> Arc<[CanvasAspect]> {
        let version = session.store().version();
        if let Some(cached) = &self.all {
            if cached.version == version {
                return Arc::clone(&cached.value);
            }
        }
        let value: Arc<[CanvasAspect]> = session.store().iter().cloned().collect();
        self.recomputations += 1;
        self.all = Some(Cached {
            version,
            value: Arc::clone(&value),
        });
        value
    }

    /// Point lookup; absence is not an error.
    pub fn aspect_by_id(&self, session: &CanvasSession, id: &AspectId) -> Option<CanvasAspect> {
        session.store().get_by_id(id).cloned()
    }

    /// Aspects whose id is still pending, in canvas order.
    pub fn pending_aspects(&mut self, session: &CanvasSession) -> Arc<[CanvasAspect]> {
        let version = session.version();
        if let Some(cached) = &self.pending {
            if cached.version == version {
                return Arc::clone(&cached.value);
            }
        }
        let pending = session.pending();
        let value: Arc<[CanvasAspect]> = self
            .all_aspects(session)
            .iter()
            .filter(|a| pending.contains(&a.id))
            .cloned()
            .collect();
        self.recomputations += 1;
        self.pending = Some(Cached {
            version,
            value: Arc::clone(&value),
        });
        value
    }

    pub fn view(&mut self, session: &CanvasSession) -> CanvasView {
        CanvasView {
            canvas_id: session.canvas_id(),
            version: session.version(),
            aspects: self.all_aspects(session),
            pending: self.pending_aspects(session),
        }
    }

    pub fn recomputations(&self) -> u64 {
        self.recomputations
    }
}
