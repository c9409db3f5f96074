//! # plancanvas-sync: transport and reference backend for PlanCanvas
//!
//! Carries [`plancanvas_core`] events and mutations over WebSocket and
//! hosts an in-memory backend that owns the canonical canvas state.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐                     ┌──────────────┐
//! │ SessionDriver │                     │  SyncServer  │
//! │ (per canvas)  │                     │  (central)   │
//! └──────┬────────┘                     └──────┬───────┘
//!        │                                     │
//!        ▼            WebSocket                ▼
//! ┌───────────────┐   bincode frames    ┌──────────────┐
//! │  SyncChannel  │ ◄─────────────────► │  CanvasRoom  │
//! │ (reconnects)  │                     │  + ledger    │
//! └───────────────┘                     └──────┬───────┘
//!                                              │
//!                                      ┌───────┴────────┐
//!                                      │ BroadcastGroup │
//!                                      │   (fan-out)    │
//!                                      └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: wire frames in both directions
//! - [`ledger`]: canonical per-canvas state, id minting, conflict checks
//! - [`broadcast`]: per-canvas fan-out of remote changes
//! - [`room`]: ledger plus broadcast group, keyed by canvas
//! - [`server`]: WebSocket backend
//! - [`backoff`]: reconnect delays
//! - [`channel`]: client connection that survives disconnects
//! - [`driver`]: client event loop owning the session

pub mod backoff;
pub mod broadcast;
pub mod channel;
pub mod driver;
pub mod ledger;
pub mod protocol;
pub mod room;
pub mod server;

pub use backoff::Backoff;
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope};
pub use channel::{ChannelConfig, ChannelEvent, ConnectionState, SyncChannel};
pub use driver::{Intent, SessionDriver, SessionHandle};
pub use ledger::{Applied, CanvasLedger};
pub use protocol::{ClientBody, ClientFrame, ProtocolError, ServerBody, ServerFrame};
pub use room::{CanvasRoom, Joined, RoomManager};
pub use server::{ServerConfig, ServerStats, SyncServer};
