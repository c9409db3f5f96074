//! In-memory reference backend.
//!
//! ```text
//! Client A ──┐
//!             ├── CanvasRoom (canvas_id) ── CanvasLedger
//! Client B ──┘          │
//!                 BroadcastGroup
//!                       │
//!            ┌──────────┼───────────┐
//!            ▼          ▼           ▼
//!         Client A   Client B    Client C
//! ```
//!
//! Per connection: `Subscribe` is answered with a snapshot, each mutation
//! with an Ack or Reject to the sender while the resulting change goes to
//! every other peer of the canvas, `Ping` with `Pong`.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use plancanvas_core::{RejectReason, SyncEvent};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::Envelope;
use crate::protocol::{ClientBody, ClientFrame, ServerFrame};
use crate::room::{CanvasRoom, RoomManager};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_peers_per_room: usize,
    /// Frames buffered per peer before it starts lagging
    pub broadcast_capacity: usize,
    /// Idle connections are dropped after this many seconds without a frame.
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            max_peers_per_room: 10,
            broadcast_capacity: 64,
            heartbeat_interval_secs: 30,
        }
    }

    /// Defaults overridden by `PLANCANVAS_BIND_ADDR`,
    /// `PLANCANVAS_BROADCAST_CAPACITY` and `PLANCANVAS_MAX_PEERS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str, default: usize| {
            lookup(key)
                .and_then(|v| match v.trim().parse() {
                    Ok(n) => Some(n),
                    Err(e) => {
                        log::warn!("ignoring {key}={v}: {e}");
                        None
                    }
                })
                .unwrap_or(default)
        };
        Self {
            bind_addr: lookup("PLANCANVAS_BIND_ADDR").unwrap_or(defaults.bind_addr),
            broadcast_capacity: parsed("PLANCANVAS_BROADCAST_CAPACITY", defaults.broadcast_capacity),
            max_peers_per_room: parsed("PLANCANVAS_MAX_PEERS", defaults.max_peers_per_room),
            heartbeat_interval_secs: defaults.heartbeat_interval_secs,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub mutations_applied: u64,
    pub mutations_rejected: u64,
    pub active_rooms: usize,
}

pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

/// Per-connection subscription state.
struct Subscription {
    peer_id: Uuid,
    room: Arc<CanvasRoom>,
    receiver: broadcast::Receiver<Arc<Envelope>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats.clone(), config).await {
                    log::error!("connection error from {addr}: {e}");
                }
                stats.write().await.active_connections -= 1;
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("websocket connection established from {addr}");

        let mut subscription: Option<Subscription> = None;
        let result = Self::pump(
            &mut ws_sender,
            &mut ws_receiver,
            addr,
            &rooms,
            &stats,
            &config,
            &mut subscription,
        )
        .await;

        if let Some(sub) = subscription {
            sub.room.leave(&sub.peer_id).await;
            log::info!("peer {} left canvas {}", sub.peer_id, sub.room.canvas_id());
        }
        result
    }

    /// Frame loop for one connection. Returns when the peer goes away; the
    /// caller releases the subscription either way.
    async fn pump(
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        addr: SocketAddr,
        rooms: &RoomManager,
        stats: &RwLock<ServerStats>,
        config: &ServerConfig,
        subscription: &mut Option<Subscription>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let idle = std::time::Duration::from_secs(config.heartbeat_interval_secs.max(1) * 2);
        loop {
            tokio::select! {
                msg = tokio::time::timeout(idle, ws_receiver.next()) => {
                    let msg = match msg {
                        Ok(msg) => msg,
                        Err(_) => {
                            log::info!("closing idle connection from {addr}");
                            break Ok(());
                        }
                    };
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            let frame = match ClientFrame::decode(&data) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("failed to decode frame from {addr}: {e}");
                                    continue;
                                }
                            };

                            match frame.body {
                                ClientBody::Subscribe => {
                                    if let Some(old) = subscription.take() {
                                        old.room.leave(&old.peer_id).await;
                                    }
                                    let room = rooms.get_or_create(frame.canvas_id).await;
                                    let Some(joined) = room.join(frame.peer_id, config.max_peers_per_room).await else {
                                        log::warn!("canvas {} is full; refusing {addr}", frame.canvas_id);
                                        break Ok(());
                                    };
                                    let snapshot = ServerFrame::event(frame.canvas_id, joined.snapshot).encode()?;
                                    ws_sender.send(Message::Binary(snapshot.into())).await?;
                                    stats.write().await.active_rooms = rooms.room_count().await;
                                    log::info!("peer {} subscribed to canvas {}", frame.peer_id, frame.canvas_id);
                                    *subscription = Some(Subscription {
                                        peer_id: frame.peer_id,
                                        room,
                                        receiver: joined.receiver,
                                    });
                                }

                                ClientBody::Mutation(mutation) => {
                                    let Some(sub) = subscription
                                        .as_ref()
                                        .filter(|s| s.room.canvas_id() == frame.canvas_id)
                                    else {
                                        log::warn!("mutation from {addr} before subscribing to {}", frame.canvas_id);
                                        let reject = SyncEvent::Reject {
                                            correlation_id: mutation.correlation_id.clone(),
                                            seq: mutation.seq,
                                            reason: RejectReason::Permission(
                                                "not subscribed to this canvas".to_string(),
                                            ),
                                        };
                                        let bytes = ServerFrame::event(frame.canvas_id, reject).encode()?;
                                        ws_sender.send(Message::Binary(bytes.into())).await?;
                                        continue;
                                    };
                                    let reply = sub.room.submit(sub.peer_id, &mutation).await?;
                                    {
                                        let mut s = stats.write().await;
                                        match reply {
                                            SyncEvent::Ack { .. } => s.mutations_applied += 1,
                                            _ => s.mutations_rejected += 1,
                                        }
                                    }
                                    let bytes = ServerFrame::event(frame.canvas_id, reply).encode()?;
                                    ws_sender.send(Message::Binary(bytes.into())).await?;
                                }

                                ClientBody::Ping => {
                                    let pong = ServerFrame::pong(frame.canvas_id).encode()?;
                                    ws_sender.send(Message::Binary(pong.into())).await?;
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection closed from {addr}");
                            break Ok(());
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("websocket error from {addr}: {e}");
                            break Ok(());
                        }

                        Some(Ok(_)) => {}
                    }
                }

                change = async {
                    match subscription.as_mut() {
                        Some(sub) => sub.receiver.recv().await,
                        // Not subscribed yet: nothing to forward.
                        None => std::future::pending().await,
                    }
                } => {
                    let Some(sub) = subscription.as_ref() else { continue };
                    match change {
                        Ok(envelope) => {
                            // Originators get an Ack instead.
                            if envelope.origin == sub.peer_id {
                                continue;
                            }
                            ws_sender.send(Message::Binary(envelope.bytes.clone().into())).await?;
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("peer {} lagged by {n} changes; resending snapshot", sub.peer_id);
                            sub.room.record_dropped(n);
                            let snapshot = sub.room.snapshot().await;
                            let bytes = ServerFrame::event(sub.room.canvas_id(), snapshot).encode()?;
                            ws_sender.send(Message::Binary(bytes.into())).await?;
                        }
                        Err(RecvError::Closed) => break Ok(()),
                    }
                }
            }
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.rooms.room_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("PLANCANVAS_BIND_ADDR", "0.0.0.0:7000"),
            ("PLANCANVAS_BROADCAST_CAPACITY", "1024"),
            ("PLANCANVAS_MAX_PEERS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let config = ServerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.broadcast_capacity, 1024);
        assert_eq!(config.max_peers_per_room, 100, "bad values fall back");
    }

    #[test]
    fn test_config_from_empty_env_is_default() {
        assert_eq!(ServerConfig::from_lookup(|_| None), ServerConfig::default());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::new(ServerConfig::for_testing("127.0.0.1:0"));
        assert_eq!(server.bind_addr(), "127.0.0.1:0");
        assert_eq!(server.stats().await, ServerStats::default());
        assert_eq!(server.room_manager().room_count().await, 0);
    }
}
