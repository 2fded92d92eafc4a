//! Composition root.
//!
//! `SyncEngine` constructs every service exactly once and hands out shared
//! references. It is created at login and torn down at logout; nothing in the
//! crate is a process-wide singleton.
//!
//! ```text
//!                    ┌─────────────── SyncEngine ───────────────┐
//!  Credentials ─────►│ HttpGateway   LocalStore ─┬─ QueueStore  │
//!                    │                           └─ SnapshotCache│
//!                    │ SessionStore  ListStore                   │
//!                    │ MutationEngine  RealtimeChannel           │
//!                    │ ConnectivityCoordinator   auth watcher    │
//!                    └───────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::{ClientConfig, ConfigError};
use crate::connectivity::ConnectivityCoordinator;
use crate::gateway::{Credentials, GatewayError, HttpGateway, RemoteGateway};
use crate::mutation::MutationEngine;
use crate::realtime::{ChannelError, InvalidationSubscriber, ListRefresher, RealtimeChannel};
use crate::state::{ListStore, SessionStore};
use crate::storage::{LocalStore, QueueStore, SnapshotCache, StoreConfig, StoreError};

/// Umbrella error for engine operations.
#[derive(Debug, Clone)]
pub enum SyncError {
    Store(StoreError),
    Gateway(GatewayError),
    Channel(ChannelError),
    Config(ConfigError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Store(e) => write!(f, "Store: {e}"),
            SyncError::Gateway(e) => write!(f, "Gateway: {e}"),
            SyncError::Channel(e) => write!(f, "Channel: {e}"),
            SyncError::Config(e) => write!(f, "Config: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Store(e)
    }
}

impl From<GatewayError> for SyncError {
    fn from(e: GatewayError) -> Self {
        SyncError::Gateway(e)
    }
}

impl From<ChannelError> for SyncError {
    fn from(e: ChannelError) -> Self {
        SyncError::Channel(e)
    }
}

impl From<ConfigError> for SyncError {
    fn from(e: ConfigError) -> Self {
        SyncError::Config(e)
    }
}

/// Owns and wires the sync services.
pub struct SyncEngine {
    config: ClientConfig,
    credentials: Arc<Credentials>,
    gateway: Arc<dyn RemoteGateway>,
    queue: Arc<QueueStore>,
    snapshots: Arc<SnapshotCache>,
    session: Arc<SessionStore>,
    list: Arc<ListStore>,
    mutations: MutationEngine,
    channel: RealtimeChannel,
    connectivity: Arc<ConnectivityCoordinator>,
    auth_watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Engine talking to the REST API described by `config`.
    pub fn new(config: ClientConfig, credentials: Arc<Credentials>) -> Result<Self, SyncError> {
        config.validate()?;
        let gateway = Arc::new(HttpGateway::new(&config, credentials.clone())?);
        Ok(Self::with_gateway(config, credentials, gateway))
    }

    /// Engine over any gateway implementation.
    pub fn with_gateway(
        config: ClientConfig,
        credentials: Arc<Credentials>,
        gateway: Arc<dyn RemoteGateway>,
    ) -> Self {
        let store = Arc::new(LocalStore::new(StoreConfig::in_dir(&config.data_dir)));
        let queue = Arc::new(QueueStore::new(store.clone()));
        let snapshots = Arc::new(SnapshotCache::new(store.clone()));
        let session = Arc::new(SessionStore::with_snapshots(snapshots.clone()));
        let list = Arc::new(ListStore::new());

        let mutations = MutationEngine::new(
            gateway.clone(),
            queue.clone(),
            session.clone(),
            list.clone(),
        );

        let refresher: Arc<dyn InvalidationSubscriber> =
            Arc::new(ListRefresher::new(list.clone(), gateway.clone()));
        let channel =
            RealtimeChannel::with_subscribers(config.clone(), credentials.clone(), vec![refresher]);

        let connectivity = Arc::new(ConnectivityCoordinator::new(
            queue.clone(),
            gateway.clone(),
            session.clone(),
            channel.clone(),
        ));

        Self {
            config,
            credentials,
            gateway,
            queue,
            snapshots,
            session,
            list,
            mutations,
            channel,
            connectivity,
            auth_watcher: Mutex::new(None),
        }
    }

    /// Bring the engine up.
    ///
    /// Opens the local store, restores the session snapshot, replays anything
    /// left in the queue, fetches fresh state and opens the realtime channel.
    /// Remote failures are logged, not returned: the engine must start offline.
    pub async fn start(&self) -> Result<(), SyncError> {
        self.queue.ensure_ready().await?;
        if self.session.restore().await? {
            log::info!("Warm start from local session snapshot");
        }

        let report = self.connectivity.replay().await?;
        if report.remaining > 0 {
            log::warn!("{} queued actions still pending after start", report.remaining);
        }

        if let Err(e) = self.refresh().await {
            log::warn!("Initial fetch failed, continuing with local state: {e}");
        }

        self.spawn_auth_watcher().await;
        if let Err(e) = self.channel.connect().await {
            log::warn!("Realtime channel unavailable at start: {e}");
        }
        log::info!("Sync engine started");
        Ok(())
    }

    /// Refetch the session, list, items and categories.
    pub async fn refresh(&self) -> Result<(), GatewayError> {
        self.session.refresh(self.gateway.as_ref()).await?;
        self.list.refresh_all(self.gateway.as_ref()).await
    }

    /// Stop background work. Local state and the queue are kept for the next
    /// start.
    pub async fn shutdown(&self) {
        if let Some(watcher) = self.auth_watcher.lock().await.take() {
            watcher.abort();
        }
        self.channel.disconnect().await;
        log::info!("Sync engine stopped");
    }

    /// Drop the credential and all session state. Queued actions stay on disk
    /// and replay after the next login.
    pub async fn logout(&self) {
        self.shutdown().await;
        self.credentials.invalidate();
        self.session.reset().await;
        self.list.reset().await;
        log::info!("Logged out, {} queued actions kept", self.pending_actions().await);
    }

    /// Number of queued actions (0 if the store cannot be read).
    pub async fn pending_actions(&self) -> usize {
        match self.queue.len().await {
            Ok(n) => n,
            Err(e) => {
                log::error!("Failed to read queue length: {e}");
                0
            }
        }
    }

    /// Close the channel when the credential is invalidated and reconnect
    /// when a new one is set.
    async fn spawn_auth_watcher(&self) {
        let mut watcher = self.auth_watcher.lock().await;
        if watcher.is_some() {
            return;
        }
        let mut rx = self.credentials.subscribe();
        let channel = self.channel.clone();
        *watcher = Some(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let present = rx.borrow_and_update().is_some();
                if present {
                    if let Err(e) = channel.connect().await {
                        log::debug!("Connect after login failed: {e}");
                    }
                } else {
                    log::warn!("Login required, closing realtime channel");
                    channel.disconnect().await;
                }
            }
        }));
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<Credentials> {
        &self.credentials
    }

    pub fn gateway(&self) -> &Arc<dyn RemoteGateway> {
        &self.gateway
    }

    pub fn queue(&self) -> &Arc<QueueStore> {
        &self.queue
    }

    pub fn snapshots(&self) -> &Arc<SnapshotCache> {
        &self.snapshots
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub fn list(&self) -> &Arc<ListStore> {
        &self.list
    }

    pub fn mutations(&self) -> &MutationEngine {
        &self.mutations
    }

    pub fn channel(&self) -> &RealtimeChannel {
        &self.channel
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityCoordinator> {
        &self.connectivity
    }
}
