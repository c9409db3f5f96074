//! # plancanvas-core: client-side canvas state for PlanCanvas
//!
//! Optimistic, offline-tolerant state machine for a shared planning canvas.
//! Everything here is transport-agnostic: events come in, mutations go out.
//!
//! ## Architecture
//!
//! ```text
//!  user intent ──► CanvasSession ──► Mutation ──► (transport)
//!                   │        ▲
//!                   │        │ SyncEvent (Snapshot / Ack / Reject / RemoteChange)
//!                   ▼        │
//!           ┌──────────────┐ ┌────────────┐
//!           │ EntityStore  │ │ PendingSet │
//!           └──────┬───────┘ └─────┬──────┘
//!                  └──────┬────────┘
//!                         ▼
//!                    Selectors ──► CanvasView (rendering)
//! ```
//!
//! ## Modules
//!
//! - [`store`]: ordered, id-keyed aspect storage
//! - [`pending`]: unconfirmed local work and unacknowledged deletes
//! - [`session`]: the session object and local intents
//! - [`reconcile`]: merging backend events into local state
//! - [`selectors`]: memoized read-only views
//! - [`event`]: the closed set of wire-level events and mutations

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub mod error;
pub mod event;
pub mod pending;
pub mod reconcile;
pub mod selectors;
pub mod session;
pub mod store;

pub use error::SyncError;
pub use event::{Mutation, MutationKind, MutationOp, RejectReason, RemoteChange, SyncEvent};
pub use pending::{DeleteOutbox, PendingEntry, PendingSet};
pub use reconcile::Reconciliation;
pub use selectors::{CanvasView, Selectors};
pub use session::{CanvasSession, SyncNotice};
pub use store::EntityStore;

/// Backend-assigned write counter for one aspect.
pub type Revision = u64;

/// Prefix of client-minted identities.
pub const TENTATIVE_PREFIX: &str = "tmp-";

/// Identity of a canvas aspect, tentative or canonical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AspectId(String);

impl AspectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh client-side identity.
    pub fn tentative() -> Self {
        Self(format!("{TENTATIVE_PREFIX}{}", Uuid::new_v4()))
    }

    /// Whether this id was minted locally and never confirmed.
    pub fn is_tentative(&self) -> bool {
        self.0.starts_with(TENTATIVE_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AspectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AspectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AspectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.width.is_finite() && self.height.is_finite()
    }
}

/// What an aspect draws as on the canvas.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub enum AspectKind {
    Note,
    Rect,
    Ellipse,
    Text,
    Frame,
    /// Edge between two other aspects; `links` holds both endpoints.
    Connector,
}

/// Longest label the backend accepts.
pub const MAX_LABEL_LEN: usize = 4096;

/// Domain attributes of an aspect. The sync engine never looks inside,
/// except for [`AspectPayload::validate`] on the backend side.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct AspectPayload {
    pub kind: AspectKind,
    pub bounds: Rect,
    pub label: String,
    /// Ids of aspects this one references.
    pub links: Vec<AspectId>,
    pub properties: BTreeMap<String, String>,
}

impl AspectPayload {
    pub fn new(kind: AspectKind, bounds: Rect) -> Self {
        Self {
            kind,
            bounds,
            label: String::new(),
            links: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn note(x: f32, y: f32, label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::new(AspectKind::Note, Rect::new(x, y, 160.0, 120.0))
        }
    }

    pub fn connector(from: AspectId, to: AspectId) -> Self {
        Self {
            links: vec![from, to],
            ..Self::new(AspectKind::Connector, Rect::default())
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Backend acceptance rules. Returns the human-readable failure.
    pub fn validate(&self) -> Result<(), String> {
        if !self.bounds.is_finite() {
            return Err("bounds must be finite".to_string());
        }
        if self.bounds.width < 0.0 || self.bounds.height < 0.0 {
            return Err("bounds must have non-negative size".to_string());
        }
        if self.label.len() > MAX_LABEL_LEN {
            return Err(format!("label exceeds {MAX_LABEL_LEN} bytes"));
        }
        if self.links.iter().any(|l| l.as_str().is_empty()) {
            return Err("links must not be empty".to_string());
        }
        if self.kind == AspectKind::Connector && self.links.len() != 2 {
            return Err("connector needs exactly two links".to_string());
        }
        Ok(())
    }
}

/// One editable element on the shared canvas.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct CanvasAspect {
    pub id: AspectId,
    /// `None` until the backend has accepted a write.
    pub revision: Option<Revision>,
    /// Tentative id this aspect was created from, stamped by the backend.
    pub origin: Option<AspectId>,
    pub payload: AspectPayload,
}

impl CanvasAspect {
    /// A locally created, unconfirmed aspect.
    pub fn tentative(id: AspectId, payload: AspectPayload) -> Self {
        Self {
            id,
            revision: None,
            origin: None,
            payload,
        }
    }

    /// A backend-confirmed aspect.
    pub fn canonical(id: impl Into<AspectId>, revision: Revision, payload: AspectPayload) -> Self {
        Self {
            id: id.into(),
            revision: Some(revision),
            origin: None,
            payload,
        }
    }

    pub fn with_origin(mut self, origin: AspectId) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn is_confirmed(&self) -> bool {
        self.revision.is_some()
    }
}
