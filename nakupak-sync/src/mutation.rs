//! Optimistic mutation engine.
//!
//! Every mutation follows the same protocol:
//!
//! ```text
//!   apply locally, keep an undo record (one write lock, no await in between)
//!            │
//!            ▼
//!      remote call ──── ok ───► reconcile with server fields ──► Confirmed
//!            │
//!          error
//!            │
//!   ┌────────┴──────────────────────────┐
//!   ▼                                   ▼
//! replay-eligible (toggle check)    everything else
//! keep optimistic value,            revert touched entities,
//! enqueue for replay ──► Queued     surface error ──► RolledBack
//! ```
//!
//! An undo record holds only what the mutation touched (removed entries and
//! their positions, or the fields it overwrote) and is applied to the store
//! as it is when the call fails. Fields that something else rewrote in the
//! meantime are left alone, and if the collection was refetched while the
//! call was in flight the undo is dropped: the refetch is the server's view.
//!
//! Each phase is also published on a broadcast stream.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::engine::SyncError;
use crate::gateway::{GatewayError, RemoteGateway};
use crate::model::{Category, EntityId, Item, ListItem, NewListEntry};
use crate::state::{ListStore, SessionStore};
use crate::storage::{PendingAction, QueueStore};

const EVENT_CAPACITY: usize = 256;

/// Kind of user mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    ToggleCheck,
    UpdateQuantity,
    RemoveItem,
    BulkRemoveItems,
    ClearList,
    AddItem,
    MergeItems,
    BulkSetCategory,
    BulkDeleteItems,
    Purchase,
}

impl MutationKind {
    /// Whether a failed call is queued for blind replay instead of rolled back.
    pub fn is_replay_eligible(&self) -> bool {
        matches!(self, MutationKind::ToggleCheck)
    }
}

/// Phase of a mutation, as published on the event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationPhase {
    AppliedOptimistically,
    Confirmed,
    Queued { queue_id: u64 },
    RolledBack { error: String },
}

/// One observed transition.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationEvent {
    pub kind: MutationKind,
    /// Entity the mutation targets, when there is a single one
    pub target: Option<EntityId>,
    pub phase: MutationPhase,
}

/// Result of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// The server accepted the change and local state holds its values
    Confirmed,
    /// The call failed; the action waits in the durable queue
    Queued { queue_id: u64 },
    /// The call failed; local state was restored
    RolledBack { error: GatewayError },
    /// The target does not exist locally; nothing was sent
    Skipped,
}

impl MutationOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, MutationOutcome::Confirmed)
    }

    pub fn is_rolled_back(&self) -> bool {
        matches!(self, MutationOutcome::RolledBack { .. })
    }
}

/// Applies user mutations optimistically and reconciles them with the server.
pub struct MutationEngine {
    gateway: Arc<dyn RemoteGateway>,
    queue: Arc<QueueStore>,
    session: Arc<SessionStore>,
    list: Arc<ListStore>,
    events: broadcast::Sender<MutationEvent>,
}

impl MutationEngine {
    pub fn new(
        gateway: Arc<dyn RemoteGateway>,
        queue: Arc<QueueStore>,
        session: Arc<SessionStore>,
        list: Arc<ListStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            gateway,
            queue,
            session,
            list,
            events,
        }
    }

    /// Subscribe to mutation phase events.
    pub fn subscribe(&self) -> broadcast::Receiver<MutationEvent> {
        self.events.subscribe()
    }

    fn emit(&self, kind: MutationKind, target: Option<EntityId>, phase: MutationPhase) {
        // No receivers is fine
        let _ = self.events.send(MutationEvent {
            kind,
            target,
            phase,
        });
    }

    /// Check or uncheck a session line.
    ///
    /// On any remote failure the optimistic value stays and the toggle is
    /// queued. Only a failure to persist the queue entry rolls back.
    pub async fn toggle_check(&self, session_item_id: EntityId) -> Result<MutationOutcome, SyncError> {
        let kind = MutationKind::ToggleCheck;
        let target = Some(session_item_id);
        let now = Utc::now().naive_utc();

        let Some(previous) = self.session.toggle_optimistic(session_item_id, now).await else {
            log::debug!("Toggle skipped: session item {session_item_id} not found");
            return Ok(MutationOutcome::Skipped);
        };
        self.emit(kind, target, MutationPhase::AppliedOptimistically);

        match self.gateway.toggle_session_check(session_item_id).await {
            Ok(state) => {
                self.session.set_check(session_item_id, state).await;
                self.emit(kind, target, MutationPhase::Confirmed);
                Ok(MutationOutcome::Confirmed)
            }
            Err(error) => {
                let action = PendingAction::ToggleCheck {
                    item_id: session_item_id,
                };
                match self.queue.enqueue(action).await {
                    Ok(queue_id) if error.is_transient() => {
                        log::warn!(
                            "Toggle of session item {session_item_id} failed ({error}), queued as #{queue_id}"
                        );
                        self.emit(kind, target, MutationPhase::Queued { queue_id });
                        Ok(MutationOutcome::Queued { queue_id })
                    }
                    Ok(queue_id) => {
                        // Still queued: the replay pass reports it as blocking
                        log::error!(
                            "Toggle of session item {session_item_id} rejected ({error}), queued as #{queue_id} anyway"
                        );
                        self.emit(kind, target, MutationPhase::Queued { queue_id });
                        Ok(MutationOutcome::Queued { queue_id })
                    }
                    Err(store_error) => {
                        log::error!(
                            "Toggle of session item {session_item_id} failed and could not be queued: {store_error}"
                        );
                        self.session.set_check(session_item_id, previous).await;
                        self.emit(
                            kind,
                            target,
                            MutationPhase::RolledBack {
                                error: store_error.to_string(),
                            },
                        );
                        Err(SyncError::Store(store_error))
                    }
                }
            }
        }
    }

    /// Change a list entry's quantity. Zero or less removes the entry.
    pub async fn update_quantity(
        &self,
        list_item_id: EntityId,
        quantity: f64,
        unit: Option<&str>,
    ) -> Result<MutationOutcome, SyncError> {
        if quantity <= 0.0 {
            return self.remove_item(list_item_id).await;
        }
        if self.list.list_entry(list_item_id).await.is_none() {
            return Ok(MutationOutcome::Skipped);
        }

        let new_unit = unit.map(str::to_string);
        let result = self
            .mutate_list(
                MutationKind::UpdateQuantity,
                Some(list_item_id),
                |list| {
                    let Some(entry) = list.iter_mut().find(|e| e.id == list_item_id) else {
                        return ListUndo::Nothing;
                    };
                    let undo = ListUndo::Restore {
                        id: list_item_id,
                        quantity: entry.quantity,
                        unit: entry.unit.clone(),
                        applied_quantity: quantity,
                        applied_unit: new_unit.clone().unwrap_or_else(|| entry.unit.clone()),
                    };
                    entry.quantity = quantity;
                    if let Some(unit) = new_unit {
                        entry.unit = unit;
                    }
                    undo
                },
                self.gateway.update_list_entry(list_item_id, quantity, unit),
            )
            .await;

        match result {
            Ok(server_entry) => {
                self.list
                    .update_list(|list| replace_entry(list, server_entry))
                    .await;
                Ok(self.confirmed(MutationKind::UpdateQuantity, Some(list_item_id)))
            }
            Err(error) => Ok(MutationOutcome::RolledBack { error }),
        }
    }

    /// Remove one entry from the list.
    pub async fn remove_item(&self, list_item_id: EntityId) -> Result<MutationOutcome, SyncError> {
        if self.list.list_entry(list_item_id).await.is_none() {
            return Ok(MutationOutcome::Skipped);
        }
        let result = self
            .mutate_list(
                MutationKind::RemoveItem,
                Some(list_item_id),
                |list| ListUndo::Reinsert(take_where(list, |e| e.id == list_item_id)),
                self.gateway.remove_list_entry(list_item_id),
            )
            .await;
        Ok(self.finish(MutationKind::RemoveItem, Some(list_item_id), result))
    }

    /// Remove several entries from the list in one call.
    pub async fn bulk_remove_items(&self, ids: &[EntityId]) -> Result<MutationOutcome, SyncError> {
        if ids.is_empty() {
            return Ok(MutationOutcome::Skipped);
        }
        let result = self
            .mutate_list(
                MutationKind::BulkRemoveItems,
                None,
                |list| ListUndo::Reinsert(take_where(list, |e| ids.contains(&e.id))),
                self.gateway.bulk_remove_list_entries(ids),
            )
            .await;
        Ok(self.finish(MutationKind::BulkRemoveItems, None, result))
    }

    /// Empty the list.
    pub async fn clear_list(&self) -> Result<MutationOutcome, SyncError> {
        let result = self
            .mutate_list(
                MutationKind::ClearList,
                None,
                |list| ListUndo::Reinsert(take_where(list, |_| true)),
                self.gateway.clear_list(),
            )
            .await;
        Ok(self.finish(MutationKind::ClearList, None, result))
    }

    /// Add an item to the list, or bump the quantity of its existing entry.
    pub async fn add_item(
        &self,
        item_id: EntityId,
        quantity: f64,
        unit: &str,
    ) -> Result<MutationOutcome, SyncError> {
        let entries = [NewListEntry::new(item_id, quantity, unit)];
        let result = self
            .mutate_list(
                MutationKind::AddItem,
                Some(item_id),
                |list| {
                    let Some(existing) = list.iter_mut().find(|e| e.item_id == item_id) else {
                        return ListUndo::Nothing;
                    };
                    let undo = ListUndo::Restore {
                        id: existing.id,
                        quantity: existing.quantity,
                        unit: existing.unit.clone(),
                        applied_quantity: existing.quantity + quantity,
                        applied_unit: existing.unit.clone(),
                    };
                    existing.quantity += quantity;
                    undo
                },
                self.gateway.add_list_entries(&entries),
            )
            .await;

        match result {
            Ok(returned) => {
                if let Some(server_entry) = returned.into_iter().find(|e| e.item_id == item_id) {
                    self.list
                        .update_list(|list| {
                            match list.iter_mut().find(|e| e.item_id == item_id) {
                                Some(existing) => *existing = server_entry,
                                None => list.push(server_entry),
                            }
                        })
                        .await;
                }
                Ok(self.confirmed(MutationKind::AddItem, Some(item_id)))
            }
            Err(error) => Ok(MutationOutcome::RolledBack { error }),
        }
    }

    /// Merge `sources` into `target` in the catalogue.
    pub async fn merge_items(
        &self,
        target: EntityId,
        sources: &[EntityId],
    ) -> Result<MutationOutcome, SyncError> {
        if sources.is_empty() {
            return Ok(MutationOutcome::Skipped);
        }
        let result = self
            .mutate_items(
                MutationKind::MergeItems,
                Some(target),
                |items| {
                    ItemsUndo::Reinsert(take_where(items, |i| {
                        i.id != target && sources.contains(&i.id)
                    }))
                },
                self.gateway.merge_items(target, sources),
            )
            .await;

        match result {
            Ok(merged) => {
                self.list
                    .update_items(|items| {
                        if let Some(existing) = items.iter_mut().find(|i| i.id == merged.id) {
                            *existing = merged;
                        }
                    })
                    .await;
                Ok(self.confirmed(MutationKind::MergeItems, Some(target)))
            }
            Err(error) => Ok(MutationOutcome::RolledBack { error }),
        }
    }

    /// Assign a category (or none) to several catalogue items.
    pub async fn bulk_set_category(
        &self,
        ids: &[EntityId],
        category_id: Option<EntityId>,
    ) -> Result<MutationOutcome, SyncError> {
        if ids.is_empty() {
            return Ok(MutationOutcome::Skipped);
        }
        let category = match category_id {
            Some(id) => self.list.category(id).await,
            None => None,
        };
        let result = self
            .mutate_items(
                MutationKind::BulkSetCategory,
                category_id,
                |items| {
                    let mut previous = Vec::new();
                    for item in items.iter_mut().filter(|i| ids.contains(&i.id)) {
                        previous.push((item.id, item.category_id, item.category.take()));
                        item.category_id = category_id;
                        item.category = category.clone();
                    }
                    ItemsUndo::Categories {
                        previous,
                        applied: category_id,
                    }
                },
                self.gateway.bulk_set_category(ids, category_id),
            )
            .await;
        Ok(self.finish(MutationKind::BulkSetCategory, category_id, result))
    }

    /// Delete several catalogue items.
    pub async fn bulk_delete_items(&self, ids: &[EntityId]) -> Result<MutationOutcome, SyncError> {
        if ids.is_empty() {
            return Ok(MutationOutcome::Skipped);
        }
        let result = self
            .mutate_items(
                MutationKind::BulkDeleteItems,
                None,
                |items| ItemsUndo::Reinsert(take_where(items, |i| ids.contains(&i.id))),
                self.gateway.bulk_delete_items(ids),
            )
            .await;
        Ok(self.finish(MutationKind::BulkDeleteItems, None, result))
    }

    /// Mark the list as purchased, then refetch it.
    ///
    /// Nothing is applied locally; the server decides which entries go.
    pub async fn purchase(&self) -> Result<MutationOutcome, SyncError> {
        let kind = MutationKind::Purchase;
        match self.gateway.purchase().await {
            Ok(()) => {
                if let Err(e) = self.list.refresh_list(self.gateway.as_ref()).await {
                    log::warn!("List refetch after purchase failed: {e}");
                }
                Ok(self.confirmed(kind, None))
            }
            Err(error) => {
                self.emit(
                    kind,
                    None,
                    MutationPhase::RolledBack {
                        error: error.to_string(),
                    },
                );
                Ok(MutationOutcome::RolledBack { error })
            }
        }
    }

    /// Apply on the list, run the call, undo the touched entries on failure.
    async fn mutate_list<T, F>(
        &self,
        kind: MutationKind,
        target: Option<EntityId>,
        apply: impl FnOnce(&mut Vec<ListItem>) -> ListUndo,
        call: F,
    ) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        let (undo, epoch) = self
            .list
            .update_list(|list| (apply(list), self.list.list_epoch()))
            .await;
        self.emit(kind, target, MutationPhase::AppliedOptimistically);

        let result = call.await;
        if let Err(error) = &result {
            let reverted = self
                .list
                .update_list(|list| {
                    if self.list.list_epoch() != epoch {
                        return false;
                    }
                    undo.revert(list);
                    true
                })
                .await;
            self.rolled_back(kind, target, error, reverted);
        }
        result
    }

    /// Apply on the catalogue, run the call, undo the touched items on failure.
    async fn mutate_items<T, F>(
        &self,
        kind: MutationKind,
        target: Option<EntityId>,
        apply: impl FnOnce(&mut Vec<Item>) -> ItemsUndo,
        call: F,
    ) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        let (undo, epoch) = self
            .list
            .update_items(|items| (apply(items), self.list.items_epoch()))
            .await;
        self.emit(kind, target, MutationPhase::AppliedOptimistically);

        let result = call.await;
        if let Err(error) = &result {
            let reverted = self
                .list
                .update_items(|items| {
                    if self.list.items_epoch() != epoch {
                        return false;
                    }
                    undo.revert(items);
                    true
                })
                .await;
            self.rolled_back(kind, target, error, reverted);
        }
        result
    }

    fn rolled_back(
        &self,
        kind: MutationKind,
        target: Option<EntityId>,
        error: &GatewayError,
        reverted: bool,
    ) {
        if reverted {
            log::warn!("{kind:?} failed ({error}), rolled back");
        } else {
            log::warn!("{kind:?} failed ({error}), refetched state already in place");
        }
        self.emit(
            kind,
            target,
            MutationPhase::RolledBack {
                error: error.to_string(),
            },
        );
    }

    fn confirmed(&self, kind: MutationKind, target: Option<EntityId>) -> MutationOutcome {
        self.emit(kind, target, MutationPhase::Confirmed);
        MutationOutcome::Confirmed
    }

    fn finish(
        &self,
        kind: MutationKind,
        target: Option<EntityId>,
        result: Result<(), GatewayError>,
    ) -> MutationOutcome {
        match result {
            Ok(()) => self.confirmed(kind, target),
            Err(error) => MutationOutcome::RolledBack { error },
        }
    }
}

/// What it takes to revert one optimistic list change.
#[derive(Debug)]
enum ListUndo {
    Nothing,
    /// Removed entries with their former positions, ascending
    Reinsert(Vec<(usize, ListItem)>),
    /// Fields of one entry before the change and the values written over them
    Restore {
        id: EntityId,
        quantity: f64,
        unit: String,
        applied_quantity: f64,
        applied_unit: String,
    },
}

impl ListUndo {
    fn revert(self, list: &mut Vec<ListItem>) {
        match self {
            ListUndo::Nothing => {}
            ListUndo::Reinsert(removed) => reinsert(list, removed, |e| e.id),
            ListUndo::Restore {
                id,
                quantity,
                unit,
                applied_quantity,
                applied_unit,
            } => {
                // A confirmed write from another mutation stays
                if let Some(entry) = list.iter_mut().find(|e| {
                    e.id == id && e.quantity == applied_quantity && e.unit == applied_unit
                }) {
                    entry.quantity = quantity;
                    entry.unit = unit;
                }
            }
        }
    }
}

/// What it takes to revert one optimistic catalogue change.
#[derive(Debug)]
enum ItemsUndo {
    /// Removed items with their former positions, ascending
    Reinsert(Vec<(usize, Item)>),
    /// Category fields per item before the change, and the category applied
    Categories {
        previous: Vec<(EntityId, Option<EntityId>, Option<Category>)>,
        applied: Option<EntityId>,
    },
}

impl ItemsUndo {
    fn revert(self, items: &mut Vec<Item>) {
        match self {
            ItemsUndo::Reinsert(removed) => reinsert(items, removed, |i| i.id),
            ItemsUndo::Categories { previous, applied } => {
                for (id, category_id, category) in previous {
                    if let Some(item) = items
                        .iter_mut()
                        .find(|i| i.id == id && i.category_id == applied)
                    {
                        item.category_id = category_id;
                        item.category = category;
                    }
                }
            }
        }
    }
}

/// Remove matching entries, keeping each one with its original index.
fn take_where<T>(entries: &mut Vec<T>, mut matches: impl FnMut(&T) -> bool) -> Vec<(usize, T)> {
    let mut taken = Vec::new();
    let mut index = 0;
    let mut original = 0;
    while index < entries.len() {
        if matches(&entries[index]) {
            taken.push((original, entries.remove(index)));
        } else {
            index += 1;
        }
        original += 1;
    }
    taken
}

/// Put removed entries back near their old positions, skipping any id that
/// is present again.
fn reinsert<T>(entries: &mut Vec<T>, removed: Vec<(usize, T)>, id: impl Fn(&T) -> EntityId) {
    for (position, entry) in removed {
        let entry_id = id(&entry);
        if entries.iter().any(|e| id(e) == entry_id) {
            continue;
        }
        let position = position.min(entries.len());
        entries.insert(position, entry);
    }
}

fn replace_entry(list: &mut [ListItem], server_entry: ListItem) {
    if let Some(existing) = list.iter_mut().find(|e| e.id == server_entry.id) {
        *existing = server_entry;
    }
}
