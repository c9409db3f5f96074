//! Binary frames exchanged over the canvas WebSocket.
//!
//! Every binary message carries exactly one bincode-encoded frame:
//! ```text
//! client ──► server   ClientFrame { peer_id, canvas_id, Subscribe | Mutation | Ping }
//! client ◄── server   ServerFrame { canvas_id, Event(SyncEvent) | Pong }
//! ```
//!
//! Events and mutations are the closed variant sets from `plancanvas-core`;
//! the frame only adds routing.

use plancanvas_core::{Mutation, SyncError, SyncEvent};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientBody {
    /// (Re)join a canvas; answered with a full snapshot.
    Subscribe,
    Mutation(Mutation),
    /// Heartbeat
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub peer_id: Uuid,
    pub canvas_id: Uuid,
    pub body: ClientBody,
}

impl ClientFrame {
    pub fn subscribe(peer_id: Uuid, canvas_id: Uuid) -> Self {
        Self {
            peer_id,
            canvas_id,
            body: ClientBody::Subscribe,
        }
    }

    pub fn mutation(peer_id: Uuid, canvas_id: Uuid, mutation: Mutation) -> Self {
        Self {
            peer_id,
            canvas_id,
            body: ClientBody::Mutation(mutation),
        }
    }

    pub fn ping(peer_id: Uuid, canvas_id: Uuid) -> Self {
        Self {
            peer_id,
            canvas_id,
            body: ClientBody::Ping,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerBody {
    Event(SyncEvent),
    Pong,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    pub canvas_id: Uuid,
    pub body: ServerBody,
}

impl ServerFrame {
    pub fn event(canvas_id: Uuid, event: SyncEvent) -> Self {
        Self {
            canvas_id,
            body: ServerBody::Event(event),
        }
    }

    pub fn pong(canvas_id: Uuid) -> Self {
        Self {
            canvas_id,
            body: ServerBody::Pong,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerFrame {
    /// Decode a frame received on a subscription to `canvas_id`.
    pub fn decode_for(bytes: &[u8], canvas_id: Uuid) -> Result<Self, ProtocolError> {
        let frame = Self::decode(bytes)?;
        if frame.canvas_id != canvas_id {
            return Err(ProtocolError::WrongCanvas {
                expected: canvas_id,
                got: frame.canvas_id,
            });
        }
        Ok(frame)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Wire-level failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("frame for canvas {got} on subscription to {expected}")]
    WrongCanvas { expected: Uuid, got: Uuid },
    #[error("connection closed")]
    ConnectionClosed,
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::ConnectionClosed => SyncError::TransportLost,
            other => SyncError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plancanvas_core::{AspectPayload, CanvasAspect, MutationOp, RejectReason};

    #[test]
    fn test_mutation_frame_roundtrip() {
        let peer = Uuid::new_v4();
        let canvas = Uuid::new_v4();
        let mutation = Mutation {
            correlation_id: "tmp-1".into(),
            seq: 42,
            op: MutationOp::Create {
                payload: AspectPayload::note(10.0, 20.0, "Plan").with_property("color", "amber"),
            },
        };

        let frame = ClientFrame::mutation(peer, canvas, mutation.clone());
        let decoded = ClientFrame::decode(&frame.encode().unwrap()).unwrap();

        assert_eq!(decoded.peer_id, peer);
        assert_eq!(decoded.canvas_id, canvas);
        assert_eq!(decoded.body, ClientBody::Mutation(mutation));
    }

    #[test]
    fn test_event_frame_roundtrip() {
        let canvas = Uuid::new_v4();
        let snapshot = SyncEvent::Snapshot(vec![
            CanvasAspect::canonical("c-1", 3, AspectPayload::note(0.0, 0.0, "a")),
            CanvasAspect::canonical("c-2", 1, AspectPayload::note(0.0, 0.0, "b"))
                .with_origin("tmp-7".into()),
        ]);
        let frame = ServerFrame::event(canvas, snapshot.clone());
        let decoded = ServerFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.body, ServerBody::Event(snapshot));

        let reject = ServerFrame::event(
            canvas,
            SyncEvent::Reject {
                correlation_id: "c-1".into(),
                seq: 9,
                reason: RejectReason::Conflict { current: Some(4) },
            },
        );
        assert_eq!(ServerFrame::decode(&reject.encode().unwrap()).unwrap(), reject);
    }

    #[test]
    fn test_heartbeat_frames_are_small() {
        let ping = ClientFrame::ping(Uuid::new_v4(), Uuid::new_v4());
        let encoded = ping.encode().unwrap();
        // two uuids plus a variant tag
        assert!(encoded.len() < 48, "ping is {} bytes", encoded.len());
        assert_eq!(ClientFrame::decode(&encoded).unwrap().body, ClientBody::Ping);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(matches!(
            ServerFrame::decode(&garbage),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_decode_for_rejects_foreign_canvas() {
        let mine = Uuid::new_v4();
        let other = Uuid::new_v4();
        let bytes = ServerFrame::pong(other).encode().unwrap();

        assert_eq!(
            ServerFrame::decode_for(&bytes, mine),
            Err(ProtocolError::WrongCanvas {
                expected: mine,
                got: other
            })
        );
        assert_eq!(
            ServerFrame::decode_for(&bytes, other).unwrap().body,
            ServerBody::Pong
        );
    }

    #[test]
    fn test_protocol_error_maps_to_sync_error() {
        assert_eq!(
            SyncError::from(ProtocolError::ConnectionClosed),
            SyncError::TransportLost
        );
        assert!(matches!(
            SyncError::from(ProtocolError::Deserialization("eof".into())),
            SyncError::Protocol(msg) if msg.contains("eof")
        ));
    }
}
