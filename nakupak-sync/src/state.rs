//! In-memory entity stores, the single source of truth for rendering.
//!
//! Readers get owned clones. Mutators are crate-private: every user-visible
//! change goes through [`crate::mutation::MutationEngine`] or an explicit
//! refresh, so optimistic bookkeeping cannot be bypassed.
//!
//! Each store exposes a revision counter on a `watch` channel that bumps on
//! every change, so a UI can redraw without polling.
//!
//! `ListStore` additionally counts refetches per collection (its epoch). The
//! counter only moves under the collection's write lock, so a mutation can
//! tell whether the server view replaced its optimistic state mid-flight.

use chrono::NaiveDateTime;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};

use crate::gateway::{GatewayError, RemoteGateway};
use crate::model::{ActiveSession, Category, CheckState, EntityId, Item, ListItem, SessionItem};
use crate::storage::{SnapshotCache, StoreError};

/// Holds the active shopping session.
pub struct SessionStore {
    session: RwLock<Option<ActiveSession>>,
    revision: watch::Sender<u64>,
    snapshots: Option<Arc<SnapshotCache>>,
    persist_lock: Mutex<()>,
}

impl SessionStore {
    /// Store without warm-restart persistence.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Store that mirrors every change into the snapshot cache.
    pub fn with_snapshots(snapshots: Arc<SnapshotCache>) -> Self {
        Self::build(Some(snapshots))
    }

    fn build(snapshots: Option<Arc<SnapshotCache>>) -> Self {
        Self {
            session: RwLock::new(None),
            revision: watch::Sender::new(0),
            snapshots,
            persist_lock: Mutex::new(()),
        }
    }

    /// Copy of the active session.
    pub async fn snapshot(&self) -> Option<ActiveSession> {
        self.session.read().await.clone()
    }

    /// Copy of one session line.
    pub async fn item(&self, session_item_id: EntityId) -> Option<SessionItem> {
        self.session
            .read()
            .await
            .as_ref()
            .and_then(|s| s.session_items.iter().find(|i| i.id == session_item_id))
            .cloned()
    }

    pub async fn is_active(&self) -> bool {
        self.session.read().await.is_some()
    }

    pub async fn checked_count(&self) -> usize {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.session_items.iter().filter(|i| i.checked).count())
            .unwrap_or(0)
    }

    pub async fn total_count(&self) -> usize {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.session_items.len())
            .unwrap_or(0)
    }

    /// Watch the revision counter.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Fetch the active session from the server, replacing local state.
    pub async fn refresh(
        &self,
        gateway: &dyn RemoteGateway,
    ) -> Result<Option<ActiveSession>, GatewayError> {
        let session = gateway.fetch_active_session().await?;
        self.replace(session.clone()).await;
        Ok(session)
    }

    /// Start a session (the server returns the running one if it exists).
    pub async fn start(&self, gateway: &dyn RemoteGateway) -> Result<ActiveSession, GatewayError> {
        let session = gateway.start_session().await?;
        log::info!(
            "Shopping session {} started with {} items",
            session.id,
            session.session_items.len()
        );
        self.replace(Some(session.clone())).await;
        Ok(session)
    }

    /// Complete the session; the server moves checked items off the list.
    pub async fn complete(&self, gateway: &dyn RemoteGateway) -> Result<(), GatewayError> {
        gateway.complete_session().await?;
        log::info!("Shopping session completed");
        self.replace(None).await;
        Ok(())
    }

    /// Abort the session without touching the list.
    pub async fn abort(&self, gateway: &dyn RemoteGateway) -> Result<(), GatewayError> {
        gateway.abort_session().await?;
        log::info!("Shopping session aborted");
        self.replace(None).await;
        Ok(())
    }

    /// Load the persisted session if nothing is in memory yet.
    ///
    /// Returns whether a session was restored.
    pub async fn restore(&self) -> Result<bool, StoreError> {
        let Some(snapshots) = &self.snapshots else {
            return Ok(false);
        };
        let Some(session) = snapshots.load_session().await? else {
            return Ok(false);
        };
        {
            let mut current = self.session.write().await;
            if current.is_some() {
                return Ok(false);
            }
            log::info!(
                "Restored session {} ({} items) from local snapshot",
                session.id,
                session.session_items.len()
            );
            *current = Some(session);
        }
        self.bump();
        Ok(true)
    }

    /// Flip a line locally. Returns the state before the flip.
    pub(crate) async fn toggle_optimistic(
        &self,
        session_item_id: EntityId,
        now: NaiveDateTime,
    ) -> Option<CheckState> {
        let previous = {
            let mut guard = self.session.write().await;
            let item = guard
                .as_mut()?
                .session_items
                .iter_mut()
                .find(|i| i.id == session_item_id)?;
            let previous = item.check_state();
            item.checked = !item.checked;
            item.checked_at = if item.checked { Some(now) } else { None };
            previous
        };
        self.bump();
        self.persist().await;
        Some(previous)
    }

    /// Overwrite a line's check fields. Returns false if the line is gone.
    pub(crate) async fn set_check(&self, session_item_id: EntityId, state: CheckState) -> bool {
        let found = {
            let mut guard = self.session.write().await;
            match guard
                .as_mut()
                .and_then(|s| s.session_items.iter_mut().find(|i| i.id == session_item_id))
            {
                Some(item) => {
                    item.checked = state.checked;
                    item.checked_at = state.checked_at;
                    true
                }
                None => false,
            }
        };
        if found {
            self.bump();
            self.persist().await;
        }
        found
    }

    /// Replace the whole session and persist it.
    pub(crate) async fn replace(&self, session: Option<ActiveSession>) {
        *self.session.write().await = session;
        self.bump();
        self.persist().await;
    }

    /// Forget the session locally and drop its snapshot (logout).
    pub(crate) async fn reset(&self) {
        self.replace(None).await;
    }

    /// Mirror the current state into the snapshot cache.
    ///
    /// Failures are logged only: the cache never blocks a user action.
    pub(crate) async fn persist(&self) {
        let Some(snapshots) = &self.snapshots else {
            return;
        };
        let _guard = self.persist_lock.lock().await;
        let current = self.session.read().await.clone();
        let result = match current {
            Some(session) => snapshots.save_session(&session).await.map(|_| ()),
            None => snapshots.clear_session().await,
        };
        if let Err(e) = result {
            log::error!("Failed to persist session snapshot: {e}");
        }
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the shopping list and the shared catalogue.
pub struct ListStore {
    list_items: RwLock<Vec<ListItem>>,
    items: RwLock<Vec<Item>>,
    categories: RwLock<Vec<Category>>,
    revision: watch::Sender<u64>,
    /// Bumped whenever the list is replaced wholesale
    list_epoch: AtomicU64,
    /// Bumped whenever the catalogue is replaced wholesale
    items_epoch: AtomicU64,
}

impl ListStore {
    pub fn new() -> Self {
        Self {
            list_items: RwLock::new(Vec::new()),
            items: RwLock::new(Vec::new()),
            categories: RwLock::new(Vec::new()),
            revision: watch::Sender::new(0),
            list_epoch: AtomicU64::new(0),
            items_epoch: AtomicU64::new(0),
        }
    }

    pub async fn list_items(&self) -> Vec<ListItem> {
        self.list_items.read().await.clone()
    }

    pub async fn list_entry(&self, list_item_id: EntityId) -> Option<ListItem> {
        self.list_items
            .read()
            .await
            .iter()
            .find(|i| i.id == list_item_id)
            .cloned()
    }

    pub async fn items(&self) -> Vec<Item> {
        self.items.read().await.clone()
    }

    pub async fn categories(&self) -> Vec<Category> {
        self.categories.read().await.clone()
    }

    pub async fn category(&self, category_id: EntityId) -> Option<Category> {
        self.categories
            .read()
            .await
            .iter()
            .find(|c| c.id == category_id)
            .cloned()
    }

    /// Watch the revision counter.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Refetch the list. Returns the number of entries.
    pub async fn refresh_list(&self, gateway: &dyn RemoteGateway) -> Result<usize, GatewayError> {
        let fresh = gateway.fetch_list().await?;
        let count = fresh.len();
        self.update_list(|list| {
            *list = fresh;
            self.list_epoch.fetch_add(1, Ordering::SeqCst);
        })
        .await;
        log::debug!("List refreshed: {count} entries");
        Ok(count)
    }

    /// Refetch the catalogue items.
    pub async fn refresh_items(&self, gateway: &dyn RemoteGateway) -> Result<usize, GatewayError> {
        let fresh = gateway.fetch_items().await?;
        let count = fresh.len();
        self.update_items(|items| {
            *items = fresh;
            self.items_epoch.fetch_add(1, Ordering::SeqCst);
        })
        .await;
        Ok(count)
    }

    /// Refetch the categories.
    pub async fn refresh_categories(
        &self,
        gateway: &dyn RemoteGateway,
    ) -> Result<usize, GatewayError> {
        let fresh = gateway.fetch_categories().await?;
        let count = fresh.len();
        *self.categories.write().await = fresh;
        self.bump();
        Ok(count)
    }

    /// Refetch list, items and categories.
    pub async fn refresh_all(&self, gateway: &dyn RemoteGateway) -> Result<(), GatewayError> {
        self.refresh_categories(gateway).await?;
        self.refresh_items(gateway).await?;
        self.refresh_list(gateway).await?;
        Ok(())
    }

    /// Mutate the list under one write lock.
    pub(crate) async fn update_list<R>(&self, f: impl FnOnce(&mut Vec<ListItem>) -> R) -> R {
        let result = {
            let mut guard = self.list_items.write().await;
            f(&mut guard)
        };
        self.bump();
        result
    }

    /// Mutate the catalogue under one write lock.
    pub(crate) async fn update_items<R>(&self, f: impl FnOnce(&mut Vec<Item>) -> R) -> R {
        let result = {
            let mut guard = self.items.write().await;
            f(&mut guard)
        };
        self.bump();
        result
    }

    /// Number of wholesale list replacements so far. Stable while the list
    /// write lock is held.
    pub(crate) fn list_epoch(&self) -> u64 {
        self.list_epoch.load(Ordering::SeqCst)
    }

    /// Number of wholesale catalogue replacements so far.
    pub(crate) fn items_epoch(&self) -> u64 {
        self.items_epoch.load(Ordering::SeqCst)
    }

    pub(crate) async fn reset(&self) {
        {
            let mut list = self.list_items.write().await;
            list.clear();
            self.list_epoch.fetch_add(1, Ordering::SeqCst);
        }
        {
            let mut items = self.items.write().await;
            items.clear();
            self.items_epoch.fetch_add(1, Ordering::SeqCst);
        }
        self.categories.write().await.clear();
        self.bump();
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }
}

impl Default for ListStore {
    fn default() -> Self {
        Self::new()
    }
}
