//! Persistent, reconnecting WebSocket subscription to one canvas.
//!
//! ```text
//!              publish()                      ChannelEvent
//! driver ──► outgoing mpsc ──► writer ─┐   ┌─► Connected / Event / Disconnected
//!                                      ▼   │
//!                          ┌──── connection task ────┐
//!                          │ subscribe on (re)connect │ ◄── backoff between attempts
//!                          └──────────────────────────┘
//! ```
//!
//! While disconnected `publish` fails fast with `TransportLost` and nothing
//! is queued; unconfirmed work lives in the session's pending set and is
//! republished after the next snapshot.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use plancanvas_core::{Mutation, SyncError, SyncEvent};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::protocol::{ClientFrame, ProtocolError, ServerBody, ServerFrame};

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    /// Frames buffered between `publish` and the socket writer
    pub outgoing_buffer: usize,
    /// Events buffered for the consumer
    pub event_buffer: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Upper bound of the uniform random delay added to every backoff
    pub backoff_jitter: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            outgoing_buffer: 256,
            event_buffer: 256,
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(10),
            backoff_jitter: Duration::from_millis(250),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

impl ChannelConfig {
    /// Fast reconnects for tests against a local server.
    pub fn for_testing(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            backoff_base: Duration::from_millis(20),
            backoff_max: Duration::from_millis(200),
            backoff_jitter: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(500),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Waiting out a backoff delay.
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Socket open and `Subscribe` sent; a snapshot follows.
    Connected,
    Event(SyncEvent),
    Disconnected,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// State shared between the handle and its connection task.
struct Shared {
    peer_id: Uuid,
    canvas_id: Uuid,
    config: ChannelConfig,
    state: RwLock<ConnectionState>,
    /// Present only while a connection is up.
    outgoing: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    event_tx: mpsc::Sender<ChannelEvent>,
}

/// Handle to one canvas subscription.
pub struct SyncChannel {
    shared: Arc<Shared>,
    event_rx: Option<mpsc::Receiver<ChannelEvent>>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SyncChannel {
    /// Subscribe to `canvas_id` under a fresh peer identity.
    pub fn subscribe(config: ChannelConfig, canvas_id: Uuid) -> Self {
        Self::subscribe_as(config, Uuid::new_v4(), canvas_id)
    }

    /// Subscribe with a caller-chosen peer identity. The backend keys
    /// idempotent replay on it, so it must stay stable across reconnects.
    pub fn subscribe_as(config: ChannelConfig, peer_id: Uuid, canvas_id: Uuid) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            peer_id,
            canvas_id,
            config,
            state: RwLock::new(ConnectionState::Connecting),
            outgoing: RwLock::new(None),
            event_tx,
        });
        let task = tokio::spawn(supervise(shared.clone(), shutdown_rx));
        Self {
            shared,
            event_rx: Some(event_rx),
            shutdown,
            task: Some(task),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ChannelEvent>> {
        self.event_rx.take()
    }

    /// Hand a mutation to the writer. Fails with `TransportLost` while
    /// disconnected; the mutation is not queued.
    pub async fn publish(&self, mutation: &Mutation) -> Result<(), SyncError> {
        let frame = ClientFrame::mutation(
            self.shared.peer_id,
            self.shared.canvas_id,
            mutation.clone(),
        );
        log::trace!("publish {} seq {}", mutation.correlation_id, mutation.seq);
        self.send(frame.encode()?).await
    }

    pub async fn ping(&self) -> Result<(), SyncError> {
        let frame = ClientFrame::ping(self.shared.peer_id, self.shared.canvas_id);
        self.send(frame.encode()?).await
    }

    async fn send(&self, bytes: Vec<u8>) -> Result<(), SyncError> {
        let tx = self
            .shared
            .outgoing
            .read()
            .await
            .clone()
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(bytes)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    pub fn peer_id(&self) -> Uuid {
        self.shared.peer_id
    }

    pub fn canvas_id(&self) -> Uuid {
        self.shared.canvas_id
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    /// Tear the subscription down and wait for the connection task to exit.
    pub async fn close(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("channel task for canvas {} failed: {e}", self.shared.canvas_id);
            }
        }
    }
}

impl Drop for SyncChannel {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn set_state(shared: &Shared, state: ConnectionState) {
    *shared.state.write().await = state;
}

/// Connect, serve, back off, repeat until shut down.
async fn supervise(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let config = &shared.config;
    let url = format!("{}/{}", config.server_url, shared.canvas_id);
    let mut backoff = Backoff::new(config.backoff_base, config.backoff_max, config.backoff_jitter);

    loop {
        set_state(&shared, ConnectionState::Connecting).await;
        let connected = tokio::select! {
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
            _ = shutdown.changed() => break,
        };

        match connected {
            Ok((ws, _)) => {
                backoff.reset();
                log::info!("connected to {url} as peer {}", shared.peer_id);
                let closed = serve(&shared, ws, &mut shutdown).await;
                *shared.outgoing.write().await = None;
                if closed {
                    break;
                }
                let _ = shared.event_tx.send(ChannelEvent::Disconnected).await;
            }
            Err(e) => {
                log::warn!("connect to {url} failed (attempt {}): {e}", backoff.attempt() + 1);
            }
        }

        set_state(&shared, ConnectionState::Reconnecting).await;
        let delay = backoff.next_delay();
        log::debug!("reconnecting to {url} in {delay:?}");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    set_state(&shared, ConnectionState::Closed).await;
    log::info!("subscription to canvas {} closed", shared.canvas_id);
}

/// Drive one open socket. Returns `true` when stopped by shutdown.
async fn serve(shared: &Shared, ws: WsStream, shutdown: &mut watch::Receiver<bool>) -> bool {
    let (mut writer, mut reader) = ws.split();

    let subscribe = match ClientFrame::subscribe(shared.peer_id, shared.canvas_id).encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            log::error!("cannot encode subscribe frame: {e}");
            return false;
        }
    };
    if let Err(e) = writer.send(Message::Binary(subscribe.into())).await {
        log::error!("subscribe to canvas {} failed: {e}", shared.canvas_id);
        return false;
    }

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(shared.config.outgoing_buffer);
    *shared.outgoing.write().await = Some(out_tx);
    set_state(shared, ConnectionState::Connected).await;
    let _ = shared.event_tx.send(ChannelEvent::Connected).await;

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => {
                let Some(bytes) = outgoing else { return false };
                if let Err(e) = writer.send(Message::Binary(bytes.into())).await {
                    log::error!("write to canvas {} failed: {e}", shared.canvas_id);
                    return false;
                }
            }

            incoming = reader.next() => match incoming {
                Some(Ok(Message::Binary(data))) => match ServerFrame::decode_for(&data, shared.canvas_id) {
                    Err(e @ ProtocolError::WrongCanvas { .. }) => log::warn!("dropping frame: {e}"),
                    Ok(ServerFrame { body: ServerBody::Event(event), .. }) => {
                        log::trace!("received {}", event.label());
                        if shared.event_tx.send(ChannelEvent::Event(event)).await.is_err() {
                            log::debug!("event consumer gone; dropping event");
                        }
                    }
                    Ok(ServerFrame { body: ServerBody::Pong, .. }) => log::trace!("pong"),
                    Err(e) => log::warn!("undecodable frame on canvas {}: {e}", shared.canvas_id),
                },
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("server closed connection for canvas {}", shared.canvas_id);
                    return false;
                }
                Some(Err(e)) => {
                    log::error!("websocket error on canvas {}: {e}", shared.canvas_id);
                    return false;
                }
                Some(Ok(_)) => {}
            },

            _ = shutdown.changed() => {
                let _ = writer.send(Message::Close(None)).await;
                return true;
            }
        }
    }
}
