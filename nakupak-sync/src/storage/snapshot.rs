//! Warm-restart cache for the active shopping session.
//!
//! The session is bincode-encoded and LZ4-compressed into the `snapshots`
//! column family together with a small metadata record, in one atomic batch.
//! It is a cache: the server stays the source of truth and the next fetch
//! overwrites whatever was restored.

use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{cf, now_millis, LocalStore, StoreError, CF_SNAPSHOTS};
use crate::model::ActiveSession;

const SESSION_KEY: &[u8] = b"active_session";
const SESSION_META_KEY: &[u8] = b"active_session.meta";

/// Metadata stored alongside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Uncompressed size in bytes
    pub raw_size: u64,
    /// Compressed size in bytes
    pub compressed_size: u64,
    /// Milliseconds since the Unix epoch
    pub saved_at: u64,
}

impl SnapshotMetadata {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Persisted copy of the active session.
pub struct SnapshotCache {
    store: Arc<LocalStore>,
}

impl SnapshotCache {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    /// Persist the session, replacing any previous snapshot.
    pub async fn save_session(
        &self,
        session: &ActiveSession,
    ) -> Result<SnapshotMetadata, StoreError> {
        let db = self.store.ensure_ready().await?;
        let cf_snapshots = cf(db, CF_SNAPSHOTS)?;

        let raw = bincode::serde::encode_to_vec(session, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&raw);

        let meta = SnapshotMetadata {
            raw_size: raw.len() as u64,
            compressed_size: compressed.len() as u64,
            saved_at: now_millis(),
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snapshots, SESSION_KEY, &compressed);
        batch.put_cf(cf_snapshots, SESSION_META_KEY, meta.encode()?);
        self.store.write(db, batch)?;

        Ok(meta)
    }

    /// Load the persisted session, if any.
    pub async fn load_session(&self) -> Result<Option<ActiveSession>, StoreError> {
        let db = self.store.ensure_ready().await?;
        let cf_snapshots = cf(db, CF_SNAPSHOTS)?;

        let compressed = match db.get_cf(cf_snapshots, SESSION_KEY)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let raw = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (session, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(Some(session))
    }

    /// Metadata of the persisted session, if any.
    pub async fn session_metadata(&self) -> Result<Option<SnapshotMetadata>, StoreError> {
        let db = self.store.ensure_ready().await?;
        let cf_snapshots = cf(db, CF_SNAPSHOTS)?;
        match db.get_cf(cf_snapshots, SESSION_META_KEY)? {
            Some(bytes) => SnapshotMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Drop the persisted session (completed, aborted, or logged out).
    pub async fn clear_session(&self) -> Result<(), StoreError> {
        let db = self.store.ensure_ready().await?;
        let cf_snapshots = cf(db, CF_SNAPSHOTS)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_snapshots, SESSION_KEY);
        batch.delete_cf(cf_snapshots, SESSION_META_KEY);
        self.store.write(db, batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CheckState, SessionItem};
    use crate::storage::StoreConfig;
    use chrono::NaiveDate;

    fn sample_session() -> ActiveSession {
        let started_at = NaiveDate::from_ymd_opt(2024, 6, 15)
            .and_then(|d| d.and_hms_opt(10, 0, 0))
            .unwrap();
        let items = (1..=20)
            .map(|i| SessionItem {
                id: i,
                item_id: Some(100 + i),
                item_name: format!("Item {i}"),
                quantity: 1.0,
                unit: "x".into(),
                checked: i % 2 == 0,
                checked_at: if i % 2 == 0 { Some(started_at) } else { None },
                item: None,
            })
            .collect();
        ActiveSession {
            id: 1,
            started_at,
            completed_at: None,
            session_items: items,
        }
    }

    #[tokio::test]
    async fn test_save_load_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::new(StoreConfig::for_testing(dir.path().join("db"))));
        let cache = SnapshotCache::new(store);

        assert!(cache.load_session().await.unwrap().is_none());

        let session = sample_session();
        let meta = cache.save_session(&session).await.unwrap();
        assert!(meta.raw_size > 0);
        assert!(meta.compressed_size > 0);

        let loaded = cache.load_session().await.unwrap().unwrap();
        assert_eq!(loaded, session);
        assert_eq!(
            loaded.session_items[1].check_state(),
            CheckState {
                checked: true,
                checked_at: Some(session.started_at)
            }
        );
        assert_eq!(cache.session_metadata().await.unwrap(), Some(meta));
    }

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let session = sample_session();

        {
            let store = Arc::new(LocalStore::new(StoreConfig::for_testing(&path)));
            SnapshotCache::new(store).save_session(&session).await.unwrap();
        }

        let store = Arc::new(LocalStore::new(StoreConfig::for_testing(&path)));
        let loaded = SnapshotCache::new(store).load_session().await.unwrap();
        assert_eq!(loaded, Some(session));
    }

    #[tokio::test]
    async fn test_clear_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::new(StoreConfig::for_testing(dir.path().join("db"))));
        let cache = SnapshotCache::new(store);

        cache.save_session(&sample_session()).await.unwrap();
        cache.clear_session().await.unwrap();
        assert!(cache.load_session().await.unwrap().is_none());
        assert!(cache.session_metadata().await.unwrap().is_none());

        // Clearing twice is fine
        cache.clear_session().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupted_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::new(StoreConfig::for_testing(dir.path().join("db"))));
        {
            let db = store.ensure_ready().await.unwrap();
            db.put_cf(cf(db, CF_SNAPSHOTS).unwrap(), SESSION_KEY, [0xFFu8; 12])
                .unwrap();
        }
        let cache = SnapshotCache::new(store);
        assert!(cache.load_session().await.is_err());
    }
}
