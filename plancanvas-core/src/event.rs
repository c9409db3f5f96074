//! Events exchanged with the backend.
//!
//! A closed set of tagged variants; dispatch is always by variant.

use serde::{Deserialize, Serialize};

use crate::{AspectId, AspectPayload, CanvasAspect, Revision};

/// A local change sent to the backend.
///
/// `correlation_id` is the tentative id for creates and the canonical id for
/// updates and deletes. `seq` is unique per client and lets the backend treat
/// republication as idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub correlation_id: AspectId,
    pub seq: u64,
    pub op: MutationOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MutationOp {
    Create {
        payload: AspectPayload,
    },
    Update {
        id: AspectId,
        base_revision: Revision,
        payload: AspectPayload,
    },
    Delete {
        id: AspectId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl Mutation {
    pub fn kind(&self) -> MutationKind {
        match self.op {
            MutationOp::Create { .. } => MutationKind::Create,
            MutationOp::Update { .. } => MutationKind::Update,
            MutationOp::Delete { .. } => MutationKind::Delete,
        }
    }

    /// Payload carried by creates and updates.
    pub fn payload(&self) -> Option<&AspectPayload> {
        match &self.op {
            MutationOp::Create { payload } | MutationOp::Update { payload, .. } => Some(payload),
            MutationOp::Delete { .. } => None,
        }
    }
}

/// Why the backend refused a mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectReason {
    Validation(String),
    Permission(String),
    /// `base_revision` did not match; `current` is what the backend holds.
    Conflict { current: Option<Revision> },
    NotFound,
}

/// A change made by another client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteChange {
    Upsert(CanvasAspect),
    Delete(AspectId),
}

/// Canonical events delivered for a subscribed canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// Full ordered state, sent on every (re)subscribe.
    Snapshot(Vec<CanvasAspect>),
    /// Confirmation of one send. `aspect` is `None` for deletes.
    Ack {
        correlation_id: AspectId,
        seq: u64,
        aspect: Option<CanvasAspect>,
    },
    Reject {
        correlation_id: AspectId,
        seq: u64,
        reason: RejectReason,
    },
    RemoteChange(RemoteChange),
}

impl SyncEvent {
    /// Short name for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Snapshot(_) => "snapshot",
            Self::Ack { .. } => "ack",
            Self::Reject { .. } => "reject",
            Self::RemoteChange(RemoteChange::Upsert(_)) => "remote-upsert",
            Self::RemoteChange(RemoteChange::Delete(_)) => "remote-delete",
        }
    }
}
