//! Connectivity and replay coordination.
//!
//! ```text
//! NetworkStatus::Offline ──► offline = true          (channel left alone)
//! NetworkStatus::Online  ──► offline = false
//!                            ├─ channel not Connected → connect() in background
//!                            └─ replay queue, FIFO, halt at first failure
//! ```
//!
//! Replays are serialized: a second replay waits for the first to finish and
//! then sees the queue the first one left behind.

use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::gateway::{GatewayError, RemoteGateway};
use crate::realtime::{ChannelStatus, RealtimeChannel};
use crate::state::SessionStore;
use crate::storage::{PendingAction, QueueStore, StoreError};

/// Platform network signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Online,
    Offline,
}

/// Process-wide connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub channel_status: ChannelStatus,
    /// Derived from the network signal, independent of the channel
    pub offline: bool,
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Entries confirmed and removed
    pub replayed: usize,
    /// Entries of this pass still queued
    pub remaining: usize,
    /// Queue id of the entry that failed, if the pass halted
    pub halted_at: Option<u64>,
    /// Why the pass halted
    pub halt_error: Option<GatewayError>,
}

impl ReplayReport {
    /// Whether a later pass may get past the entry this one halted at.
    ///
    /// `false` when the pass did not halt or the server rejected the entry
    /// outright; such an entry blocks the queue until it is cleared.
    pub fn may_retry(&self) -> bool {
        self.halt_error.as_ref().is_some_and(GatewayError::is_transient)
    }
}

/// Observes network availability and drains the durable queue.
pub struct ConnectivityCoordinator {
    queue: Arc<QueueStore>,
    gateway: Arc<dyn RemoteGateway>,
    session: Arc<SessionStore>,
    channel: RealtimeChannel,
    offline: watch::Sender<bool>,
    replay_lock: Mutex<()>,
}

impl ConnectivityCoordinator {
    pub fn new(
        queue: Arc<QueueStore>,
        gateway: Arc<dyn RemoteGateway>,
        session: Arc<SessionStore>,
        channel: RealtimeChannel,
    ) -> Self {
        Self {
            queue,
            gateway,
            session,
            channel,
            offline: watch::Sender::new(false),
            replay_lock: Mutex::new(()),
        }
    }

    pub fn is_offline(&self) -> bool {
        *self.offline.borrow()
    }

    /// Watch the offline flag.
    pub fn watch_offline(&self) -> watch::Receiver<bool> {
        self.offline.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState {
            channel_status: self.channel.status(),
            offline: self.is_offline(),
        }
    }

    /// React to a network transition.
    ///
    /// Returns the replay report when the transition was to Online.
    pub async fn handle(&self, status: NetworkStatus) -> Result<Option<ReplayReport>, StoreError> {
        match status {
            NetworkStatus::Offline => {
                if !self.offline.send_replace(true) {
                    log::warn!("Network offline");
                }
                Ok(None)
            }
            NetworkStatus::Online => {
                if self.offline.send_replace(false) {
                    log::info!("Network back online");
                }
                if self.channel.status() != ChannelStatus::Connected {
                    let channel = self.channel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = channel.connect().await {
                            log::debug!("Connect after going online failed: {e}");
                        }
                    });
                }
                self.replay().await.map(Some)
            }
        }
    }

    /// Drain the queue in order, stopping at the first failure.
    pub async fn replay(&self) -> Result<ReplayReport, StoreError> {
        let _guard = self.replay_lock.lock().await;

        let pending = self.queue.list_all().await?;
        if pending.is_empty() {
            return Ok(ReplayReport::default());
        }
        let total = pending.len();
        log::info!("Replaying {total} queued actions");

        let mut replayed = 0;
        for entry in pending {
            if let Err(e) = self.dispatch(&entry.action).await {
                let remaining = total - replayed;
                if e.is_transient() {
                    log::warn!(
                        "Replay halted at #{} ({}): {e}; {remaining} actions left",
                        entry.id,
                        entry.action.kind()
                    );
                } else {
                    log::error!(
                        "Replay blocked at #{} ({}): {e}; retrying will not help, {remaining} actions left",
                        entry.id,
                        entry.action.kind()
                    );
                }
                return Ok(ReplayReport {
                    replayed,
                    remaining,
                    halted_at: Some(entry.id),
                    halt_error: Some(e),
                });
            }
            self.queue.remove_by_id(entry.id).await?;
            replayed += 1;
        }

        log::info!("Replay complete: {replayed} actions confirmed");
        Ok(ReplayReport {
            replayed,
            remaining: 0,
            halted_at: None,
            halt_error: None,
        })
    }

    async fn dispatch(&self, action: &PendingAction) -> Result<(), GatewayError> {
        match action {
            PendingAction::ToggleCheck { item_id } => {
                let state = self.gateway.toggle_session_check(*item_id).await?;
                self.session.set_check(*item_id, state).await;
                Ok(())
            }
        }
    }

    /// Feed network transitions from `rx` until the sender is dropped.
    pub fn spawn(self: Arc<Self>, mut rx: mpsc::Receiver<NetworkStatus>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(status) = rx.recv().await {
                if let Err(e) = self.handle(status).await {
                    log::error!("Replay failed on local store: {e}");
                }
            }
        })
    }
}
