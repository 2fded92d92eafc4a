//! Realtime channel manager.
//!
//! State machine:
//! ```text
//!                  connect()                 handshake ok
//! Disconnected ─────────────────► Connecting ─────────────► Connected
//!      ▲  ▲                           │                         │
//!      │  └──── handshake failed ─────┘                         │
//!      │                                                        │
//!      └──────────── closed by server / transport error ◄───────┘
//!                 (reconnect timer armed, fixed delay)
//! ```
//!
//! The manager owns at most one reconnect timer. Every `connect()` and
//! `disconnect()` bumps a generation counter; a handshake, reader task or timer
//! from an older generation finds the counter moved and stands down.
//!
//! Inbound text frames are parsed into [`ServerEvent`]s. Every event is
//! broadcast; invalidation events are additionally handed to registered
//! [`InvalidationSubscriber`]s, one at a time, in arrival order.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::ClientConfig;
use crate::gateway::{Credentials, RemoteGateway};
use crate::protocol::ServerEvent;
use crate::state::ListStore;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_CAPACITY: usize = 64;

/// Channel connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Receives invalidation events and refetches the state it owns.
#[async_trait]
pub trait InvalidationSubscriber: Send + Sync {
    async fn invalidated(&self, event: &ServerEvent);
}

/// Refetches the shopping list on `list_updated`.
pub struct ListRefresher {
    list: Arc<ListStore>,
    gateway: Arc<dyn RemoteGateway>,
}

impl ListRefresher {
    pub fn new(list: Arc<ListStore>, gateway: Arc<dyn RemoteGateway>) -> Self {
        Self { list, gateway }
    }
}

#[async_trait]
impl InvalidationSubscriber for ListRefresher {
    async fn invalidated(&self, event: &ServerEvent) {
        if !matches!(event, ServerEvent::ListUpdated) {
            return;
        }
        if let Err(e) = self.list.refresh_list(self.gateway.as_ref()).await {
            log::warn!("List refetch after invalidation failed: {e}");
        }
    }
}

/// Channel errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelError {
    /// Endpoint URL could not be built
    InvalidUrl(String),
    /// WebSocket handshake failed
    Handshake(String),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::InvalidUrl(e) => write!(f, "Invalid realtime URL: {e}"),
            ChannelError::Handshake(e) => write!(f, "Realtime handshake failed: {e}"),
        }
    }
}

impl std::error::Error for ChannelError {}

#[derive(Default)]
struct ChannelControl {
    generation: u64,
    /// Signals the reader task of the open connection to close it
    close_tx: Option<oneshot::Sender<()>>,
    reconnect: Option<JoinHandle<()>>,
}

struct ChannelInner {
    config: ClientConfig,
    credentials: Arc<Credentials>,
    status: watch::Sender<ChannelStatus>,
    events: broadcast::Sender<ServerEvent>,
    subscribers: RwLock<Vec<Arc<dyn InvalidationSubscriber>>>,
    control: Mutex<ChannelControl>,
}

/// Persistent push connection with automatic reconnect.
///
/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

impl RealtimeChannel {
    pub fn new(config: ClientConfig, credentials: Arc<Credentials>) -> Self {
        Self::with_subscribers(config, credentials, Vec::new())
    }

    /// Channel with invalidation subscribers registered up front.
    pub fn with_subscribers(
        config: ClientConfig,
        credentials: Arc<Credentials>,
        subscribers: Vec<Arc<dyn InvalidationSubscriber>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ChannelInner {
                config,
                credentials,
                status: watch::Sender::new(ChannelStatus::Disconnected),
                events,
                subscribers: RwLock::new(subscribers),
                control: Mutex::new(ChannelControl::default()),
            }),
        }
    }

    /// Current status.
    pub fn status(&self) -> ChannelStatus {
        *self.inner.status.borrow()
    }

    /// Watch status transitions.
    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.status.subscribe()
    }

    /// Every parsed inbound event, handled or not.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// Register a subscriber for invalidation events.
    pub async fn add_subscriber(&self, subscriber: Arc<dyn InvalidationSubscriber>) {
        self.inner.subscribers.write().await.push(subscriber);
    }

    /// Whether a reconnect timer is armed.
    pub async fn has_pending_reconnect(&self) -> bool {
        self.inner.control.lock().await.reconnect.is_some()
    }

    /// Open the channel.
    ///
    /// No-op without a credential and while Connecting or Connected. A failed
    /// handshake arms the reconnect timer and is also returned to the caller.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        self.clone().open().await
    }

    /// Close the channel and cancel any pending reconnect. Safe to call at
    /// any time.
    pub async fn disconnect(&self) {
        let mut ctl = self.inner.control.lock().await;
        ctl.generation += 1;
        if let Some(timer) = ctl.reconnect.take() {
            timer.abort();
        }
        if let Some(close_tx) = ctl.close_tx.take() {
            let _ = close_tx.send(());
        }
        let previous = self.inner.status.send_replace(ChannelStatus::Disconnected);
        if previous != ChannelStatus::Disconnected {
            log::info!("Realtime channel disconnected");
        }
    }

    fn open(self) -> BoxFuture<'static, Result<(), ChannelError>> {
        Box::pin(async move {
            let Some(token) = self.inner.credentials.token() else {
                log::debug!("Realtime connect skipped: no credential");
                return Ok(());
            };
            let url = self
                .inner
                .config
                .ws_url(&token)
                .map_err(|e| ChannelError::InvalidUrl(e.to_string()))?;

            let generation = {
                let mut ctl = self.inner.control.lock().await;
                if *self.inner.status.borrow() != ChannelStatus::Disconnected {
                    return Ok(());
                }
                if let Some(timer) = ctl.reconnect.take() {
                    timer.abort();
                }
                ctl.generation += 1;
                self.inner.status.send_replace(ChannelStatus::Connecting);
                ctl.generation
            };

            log::debug!("Realtime channel connecting (generation {generation})");
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((mut ws, _)) => {
                    let mut ctl = self.inner.control.lock().await;
                    if ctl.generation != generation {
                        drop(ctl);
                        log::debug!("Dropping stale realtime connection (generation {generation})");
                        let _ = ws.close(None).await;
                        return Ok(());
                    }
                    let (close_tx, close_rx) = oneshot::channel();
                    tokio::spawn(self.clone().read_loop(ws, close_rx, generation));
                    ctl.close_tx = Some(close_tx);
                    self.inner.status.send_replace(ChannelStatus::Connected);
                    log::info!("Realtime channel connected");
                    Ok(())
                }
                Err(e) => {
                    log::warn!("Realtime handshake failed: {e}");
                    let mut ctl = self.inner.control.lock().await;
                    if ctl.generation == generation {
                        self.inner.status.send_replace(ChannelStatus::Disconnected);
                        self.schedule_reconnect(&mut ctl);
                    }
                    Err(ChannelError::Handshake(e.to_string()))
                }
            }
        })
    }

    /// Arm the single reconnect timer, replacing any pending one.
    fn schedule_reconnect(&self, ctl: &mut ChannelControl) {
        if let Some(old) = ctl.reconnect.take() {
            old.abort();
        }
        let generation = ctl.generation;
        let delay = self.inner.config.reconnect_delay;
        let channel = self.clone();
        log::info!("Realtime channel reconnecting in {delay:?}");

        ctl.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut ctl = channel.inner.control.lock().await;
                if ctl.generation != generation {
                    return;
                }
                // Release our own handle so open() does not abort this task
                ctl.reconnect = None;
            }
            if let Err(e) = channel.open().await {
                log::debug!("Reconnect attempt failed: {e}");
            }
        }));
    }

    async fn read_loop(self, mut ws: WsStream, mut close_rx: oneshot::Receiver<()>, generation: u64) {
        loop {
            tokio::select! {
                _ = &mut close_rx => {
                    // Local disconnect: no reconnect
                    let _ = ws.close(None).await;
                    return;
                }
                msg = ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.dispatch(text.as_str()).await,
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("Realtime channel closed by server: {frame:?}");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("Realtime channel error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
        self.handle_closed(generation).await;
    }

    async fn dispatch(&self, text: &str) {
        let event = match ServerEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Ignoring malformed realtime frame: {e}");
                return;
            }
        };
        log::debug!("Realtime event: {}", event.kind());

        if event.is_invalidation() {
            let subscribers = self.inner.subscribers.read().await.clone();
            for subscriber in subscribers {
                subscriber.invalidated(&event).await;
            }
        }
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }

    async fn handle_closed(&self, generation: u64) {
        let mut ctl = self.inner.control.lock().await;
        if ctl.generation != generation {
            return;
        }
        ctl.close_tx = None;
        self.inner.status.send_replace(ChannelStatus::Disconnected);
        self.schedule_reconnect(&mut ctl);
    }
}
