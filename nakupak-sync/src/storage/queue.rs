//! Durable queue of actions waiting to be replayed against the server.
//!
//! Records live in the `sync_queue` column family:
//! - key:   id (8 bytes big-endian, so iteration order == insertion order)
//! - value: JSON `{"id": 7, "type": "toggle_check", "itemId": 10, "timestamp": 1718452800000}`
//!
//! Ids come from a counter persisted in `queue_meta` in the same write batch
//! as the record, so an id is never handed out twice, even after `clear()`
//! or a crash.

use rocksdb::{IteratorMode, WriteBatch};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{cf, now_millis, LocalStore, StoreError, CF_QUEUE, CF_QUEUE_META};
use crate::model::EntityId;

const NEXT_ID_KEY: &[u8] = b"next_id";

/// An action that is safe to replay blindly later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PendingAction {
    /// Flip the check mark of a session item
    ToggleCheck {
        #[serde(rename = "itemId")]
        item_id: EntityId,
    },
}

impl PendingAction {
    /// Wire tag of this action.
    pub fn kind(&self) -> &'static str {
        match self {
            PendingAction::ToggleCheck { .. } => "toggle_check",
        }
    }
}

/// A queued action with its store-assigned identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedAction {
    /// Monotonic sequence number assigned at insertion
    pub id: u64,
    /// The mutation to replay
    pub action: PendingAction,
    /// Milliseconds since the Unix epoch, local clock
    pub enqueued_at: u64,
}

impl QueuedAction {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let mut value = serde_json::to_value(&self.action)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let object = value.as_object_mut().ok_or_else(|| {
            StoreError::SerializationError("queued action is not a JSON object".into())
        })?;
        object.insert("id".into(), self.id.into());
        object.insert("timestamp".into(), self.enqueued_at.into());
        serde_json::to_vec(&value).map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        let id = value
            .get("id")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| StoreError::DeserializationError("missing id".into()))?;
        let enqueued_at = value.get("timestamp").and_then(|v| v.as_u64()).unwrap_or(0);
        let action = serde_json::from_value(value)
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(Self {
            id,
            action,
            enqueued_at,
        })
    }
}

/// Crash-durable FIFO of pending actions.
pub struct QueueStore {
    store: Arc<LocalStore>,
    /// Next id to hand out; `None` until recovered from disk
    next_id: Mutex<Option<u64>>,
}

impl QueueStore {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self {
            store,
            next_id: Mutex::new(None),
        }
    }

    /// Open the backing store and recover the id counter ahead of first use.
    ///
    /// Operations open the store on demand, so this only moves the cost (and
    /// any open error) to a point the caller chooses. Idempotent.
    pub async fn ensure_ready(&self) -> Result<(), StoreError> {
        let db = self.store.ensure_ready().await?;
        let mut next_id = self.next_id.lock().await;
        if next_id.is_none() {
            *next_id = Some(Self::recover_next_id(db)?);
        }
        Ok(())
    }

    /// Append an action. Returns the id assigned to it.
    pub async fn enqueue(&self, action: PendingAction) -> Result<u64, StoreError> {
        let db = self.store.ensure_ready().await?;
        let cf_queue = cf(db, CF_QUEUE)?;
        let cf_meta = cf(db, CF_QUEUE_META)?;

        // Held across the write so ids hit disk in order
        let mut next_id = self.next_id.lock().await;
        let id = match *next_id {
            Some(id) => id,
            None => Self::recover_next_id(db)?,
        };

        let entry = QueuedAction {
            id,
            action,
            enqueued_at: now_millis(),
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_queue, id.to_be_bytes(), entry.encode()?);
        batch.put_cf(cf_meta, NEXT_ID_KEY, (id + 1).to_be_bytes());
        self.store.write(db, batch)?;

        *next_id = Some(id + 1);
        log::debug!("Queued {} as #{id}", entry.action.kind());
        Ok(id)
    }

    /// All queued actions in insertion order.
    ///
    /// Records that fail to decode are skipped (and logged), not deleted.
    pub async fn list_all(&self) -> Result<Vec<QueuedAction>, StoreError> {
        let db = self.store.ensure_ready().await?;
        let cf_queue = cf(db, CF_QUEUE)?;

        let mut actions = Vec::new();
        for item in db.iterator_cf(cf_queue, IteratorMode::Start) {
            let (key, value) = item?;
            match QueuedAction::decode(&value) {
                Ok(action) => actions.push(action),
                Err(e) => log::warn!("Skipping unreadable queue record {key:?}: {e}"),
            }
        }
        Ok(actions)
    }

    /// Remove one action. Removing an absent id is a no-op.
    pub async fn remove_by_id(&self, id: u64) -> Result<(), StoreError> {
        let db = self.store.ensure_ready().await?;
        let cf_queue = cf(db, CF_QUEUE)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_queue, id.to_be_bytes());
        self.store.write(db, batch)
    }

    /// Remove every queued action. Returns how many were removed.
    ///
    /// The id counter is left alone so ids stay unique.
    pub async fn clear(&self) -> Result<usize, StoreError> {
        let db = self.store.ensure_ready().await?;
        let cf_queue = cf(db, CF_QUEUE)?;

        let mut count = 0usize;
        let mut batch = WriteBatch::default();
        for item in db.iterator_cf(cf_queue, IteratorMode::Start) {
            let (key, _) = item?;
            batch.delete_cf(cf_queue, &key);
            count += 1;
        }

        if count > 0 {
            self.store.write(db, batch)?;
            log::info!("Cleared {count} queued actions");
        }
        Ok(count)
    }

    /// Number of queued actions.
    pub async fn len(&self) -> Result<usize, StoreError> {
        let db = self.store.ensure_ready().await?;
        let cf_queue = cf(db, CF_QUEUE)?;
        let mut count = 0usize;
        for item in db.iterator_cf(cf_queue, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    /// Recover the next id: past both the persisted counter and the last key.
    fn recover_next_id(db: &rocksdb::DB) -> Result<u64, StoreError> {
        let cf_meta = cf(db, CF_QUEUE_META)?;
        let cf_queue = cf(db, CF_QUEUE)?;

        let from_meta = db.get_cf(cf_meta, NEXT_ID_KEY)?.and_then(|v| read_u64(&v));

        let mut iter = db.iterator_cf(cf_queue, IteratorMode::End);
        let from_keys = match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                read_u64(&key).map(|last| last + 1)
            }
            None => None,
        };

        Ok(from_meta.unwrap_or(1).max(from_keys.unwrap_or(1)))
    }
}

fn read_u64(bytes: &[u8]) -> Option<u64> {
    let buf: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(buf))
}
