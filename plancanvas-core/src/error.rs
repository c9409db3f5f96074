use thiserror::Error;

use crate::event::RejectReason;
use crate::{AspectId, Revision};

/// Failures the sync engine reports. None of them end a session.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    /// Payload failed backend rules (or the caller lacks permission).
    #[error("rejected by backend: {0}")]
    ValidationRejected(String),

    /// Update was based on a revision the backend no longer holds.
    #[error("stale revision for {id} (backend holds {current:?})")]
    ConflictRejected {
        id: AspectId,
        current: Option<Revision>,
    },

    /// Connection dropped; work stays pending until reconnect.
    #[error("transport lost")]
    TransportLost,

    /// Operation referenced an id not present locally.
    #[error("unknown aspect id: {0}")]
    UnknownId(AspectId),

    /// Frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SyncError {
    /// Map a backend refusal for `id` onto the error surfaced to the UI.
    pub fn from_reject(id: &AspectId, reason: &RejectReason) -> Self {
        match reason {
            RejectReason::Validation(msg) => Self::ValidationRejected(msg.clone()),
            RejectReason::Permission(msg) => {
                Self::ValidationRejected(format!("permission denied: {msg}"))
            }
            RejectReason::Conflict { current } => Self::ConflictRejected {
                id: id.clone(),
                current: *current,
            },
            RejectReason::NotFound => Self::UnknownId(id.clone()),
        }
    }

    /// Whether a reconnect is the right reaction.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::TransportLost)
    }
}
