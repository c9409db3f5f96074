//! The client event loop.
//!
//! [`SessionDriver`] exclusively owns the [`CanvasSession`] and its
//! [`Selectors`] and reacts to one thing at a time: a user intent, a channel
//! event or a heartbeat tick. No lock guards the session; the loop is the
//! only writer.
//!
//! ```text
//! SessionHandle ──Intent──►┐
//!                          ├─► SessionDriver ──► watch<CanvasView>
//! SyncChannel ──Event─────►┘        │        └─► mpsc<SyncNotice>
//!      ▲                            │
//!      └────────── publish ─────────┘
//! ```

use std::time::Duration;

use plancanvas_core::{
    AspectId, AspectPayload, CanvasSession, CanvasView, Mutation, Selectors, SyncError, SyncEvent,
    SyncNotice,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::channel::{ChannelConfig, ChannelEvent, SyncChannel};

const INTENT_BUFFER: usize = 64;
const NOTICE_BUFFER: usize = 64;

type Started = (SessionDriver, SessionHandle, mpsc::Receiver<SyncNotice>);

/// A local edit request from the rendering layer.
#[derive(Debug)]
pub enum Intent {
    Create {
        payload: AspectPayload,
        reply: oneshot::Sender<AspectId>,
    },
    Update {
        id: AspectId,
        payload: AspectPayload,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    Delete {
        id: AspectId,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    Shutdown,
}

/// Cloneable front end to a running driver.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    canvas_id: Uuid,
    intents: mpsc::Sender<Intent>,
    view: watch::Receiver<CanvasView>,
}

impl SessionHandle {
    pub fn canvas_id(&self) -> Uuid {
        self.canvas_id
    }

    /// Create an aspect; returns its tentative id once it is visible.
    pub async fn create(&self, payload: AspectPayload) -> Result<AspectId, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Intent::Create { payload, reply }).await?;
        rx.await.map_err(|_| SyncError::TransportLost)
    }

    pub async fn update(&self, id: AspectId, payload: AspectPayload) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Intent::Update { id, payload, reply }).await?;
        rx.await.map_err(|_| SyncError::TransportLost)?
    }

    pub async fn delete(&self, id: AspectId) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Intent::Delete { id, reply }).await?;
        rx.await.map_err(|_| SyncError::TransportLost)?
    }

    /// Stop the driver and close its channel.
    pub async fn shutdown(&self) {
        let _ = self.intents.send(Intent::Shutdown).await;
    }

    /// Latest published view.
    pub fn view(&self) -> CanvasView {
        self.view.borrow().clone()
    }

    /// Receiver notified on every view change.
    pub fn watch(&self) -> watch::Receiver<CanvasView> {
        self.view.clone()
    }

    async fn send(&self, intent: Intent) -> Result<(), SyncError> {
        self.intents
            .send(intent)
            .await
            .map_err(|_| SyncError::TransportLost)
    }
}

pub struct SessionDriver {
    session: CanvasSession,
    selectors: Selectors,
    channel: SyncChannel,
    events: mpsc::Receiver<ChannelEvent>,
    intents: mpsc::Receiver<Intent>,
    view_tx: watch::Sender<CanvasView>,
    notice_tx: mpsc::Sender<SyncNotice>,
    heartbeat: Duration,
    awaiting_snapshot: bool,
}

impl SessionDriver {
    /// Wire a driver to an already subscribed channel.
    pub fn new(mut channel: SyncChannel) -> Result<Started, SyncError> {
        let events = channel
            .take_event_rx()
            .ok_or_else(|| SyncError::Protocol("channel events already taken".to_string()))?;
        let canvas_id = channel.canvas_id();
        let heartbeat = channel.config().heartbeat_interval;
        let (intent_tx, intents) = mpsc::channel(INTENT_BUFFER);
        let (view_tx, view) = watch::channel(CanvasView::empty(canvas_id));
        let (notice_tx, notices) = mpsc::channel(NOTICE_BUFFER);

        let driver = Self {
            session: CanvasSession::new(canvas_id),
            selectors: Selectors::new(),
            channel,
            events,
            intents,
            view_tx,
            notice_tx,
            heartbeat,
            awaiting_snapshot: true,
        };
        let handle = SessionHandle {
            canvas_id,
            intents: intent_tx,
            view,
        };
        Ok((driver, handle, notices))
    }

    /// Subscribe to `canvas_id` and spawn the driver loop.
    pub fn start(
        config: ChannelConfig,
        canvas_id: Uuid,
    ) -> Result<(SessionHandle, mpsc::Receiver<SyncNotice>, JoinHandle<()>), SyncError> {
        let channel = SyncChannel::subscribe(config, canvas_id);
        let (driver, handle, notices) = Self::new(channel)?;
        let task = tokio::spawn(driver.run());
        Ok((handle, notices, task))
    }

    pub async fn run(mut self) {
        let canvas_id = self.session.canvas_id();
        log::info!("session driver for canvas {canvas_id} started");
        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                intent = self.intents.recv() => match intent {
                    Some(Intent::Shutdown) | None => break,
                    Some(intent) => self.on_intent(intent).await,
                },
                event = self.events.recv() => match event {
                    Some(event) => self.on_channel_event(event).await,
                    None => break,
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = self.channel.ping().await {
                        log::trace!("heartbeat skipped: {e}");
                    }
                }
            }
        }

        self.channel.close().await;
        log::info!(
            "session driver for canvas {canvas_id} stopped with {} pending",
            self.session.pending().len()
        );
    }

    async fn on_intent(&mut self, intent: Intent) {
        match intent {
            Intent::Create { payload, reply } => {
                let (id, mutation) = self.session.create(payload);
                self.publish_view();
                self.send(&mutation).await;
                let _ = reply.send(id);
            }
            Intent::Update { id, payload, reply } => match self.session.update(&id, payload) {
                Ok(next) => {
                    self.publish_view();
                    if let Some(mutation) = next {
                        self.send(&mutation).await;
                    }
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Intent::Delete { id, reply } => match self.session.delete(&id) {
                Ok(mutation) => {
                    self.publish_view();
                    self.send(&mutation).await;
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Intent::Shutdown => {}
        }
    }

    async fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => {
                log::info!(
                    "canvas {} connected; awaiting snapshot with {} pending",
                    self.session.canvas_id(),
                    self.session.pending().len()
                );
                self.awaiting_snapshot = true;
            }
            ChannelEvent::Event(event) => {
                if matches!(event, SyncEvent::Snapshot(_)) {
                    self.awaiting_snapshot = false;
                }
                let reconciliation = self.session.apply(event);
                if reconciliation.changed {
                    self.publish_view();
                }
                for mutation in &reconciliation.outgoing {
                    self.send(mutation).await;
                }
                for notice in reconciliation.notices {
                    self.notify(notice);
                }
            }
            ChannelEvent::Disconnected => {
                log::warn!(
                    "canvas {} disconnected; {} pending kept",
                    self.session.canvas_id(),
                    self.session.pending().len()
                );
                self.awaiting_snapshot = true;
                self.notify(SyncNotice::ConnectionLost);
            }
        }
    }

    /// Publish one mutation. Until the post-connect snapshot has been applied
    /// nothing is sent; the snapshot republishes all outstanding work.
    async fn send(&self, mutation: &Mutation) {
        if self.awaiting_snapshot {
            log::debug!("holding {} until snapshot", mutation.correlation_id);
            return;
        }
        match self.channel.publish(mutation).await {
            Ok(()) => {}
            Err(e) if e.is_transport() => {
                log::debug!("{} stays pending until reconnect", mutation.correlation_id);
            }
            Err(e) => log::error!("cannot publish {}: {e}", mutation.correlation_id),
        }
    }

    fn publish_view(&mut self) {
        let view = self.selectors.view(&self.session);
        if view.version != self.view_tx.borrow().version {
            self.view_tx.send_replace(view);
        }
    }

    fn notify(&self, notice: SyncNotice) {
        if let Err(e) = self.notice_tx.try_send(notice) {
            log::warn!("notice dropped: {e}");
        }
    }
}
