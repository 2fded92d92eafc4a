//! Local crash-durable storage.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   enqueue / list / remove   ┌──────────────────────────────┐
//! │ QueueStore   │ ──────────────────────────► │ LocalStore (RocksDB)         │
//! └──────────────┘                             │                              │
//! ┌──────────────┐   save / load session       │ CF "sync_queue" — actions    │
//! │ SnapshotCache│ ──────────────────────────► │ CF "queue_meta" — next id    │
//! └──────────────┘                             │ CF "snapshots"  — warm start │
//!                                              └──────────────────────────────┘
//! ```
//!
//! The database is opened lazily: every entry point awaits
//! [`LocalStore::ensure_ready`], which opens it exactly once even when several
//! callers race for first use.

pub mod queue;
pub mod snapshot;

pub use queue::{PendingAction, QueueStore, QueuedAction};
pub use snapshot::{SnapshotCache, SnapshotMetadata};

use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, WriteOptions, DB};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::sync::OnceCell;

/// Column family names.
pub(crate) const CF_QUEUE: &str = "sync_queue";
pub(crate) const CF_QUEUE_META: &str = "queue_meta";
pub(crate) const CF_SNAPSHOTS: &str = "snapshots";

const COLUMN_FAMILIES: &[&str] = &[CF_QUEUE, CF_QUEUE_META, CF_SNAPSHOTS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// fsync every write (default: true; queued actions must survive power loss)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 64)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("nakupak_data").join("offline"),
            sync_writes: true,
            max_open_files: 64,
        }
    }
}

impl StoreConfig {
    /// Config rooted under a data directory.
    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join("offline"),
            ..Self::default()
        }
    }

    /// Create config for testing (no fsync, caller-provided directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: false,
            max_open_files: 32,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Lazily opened RocksDB instance shared by the queue and the snapshot cache.
pub struct LocalStore {
    config: StoreConfig,
    db: OnceCell<DB>,
}

impl LocalStore {
    /// Create a handle. Nothing touches the disk until first use.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            db: OnceCell::new(),
        }
    }

    /// Open the database if it is not open yet. Idempotent.
    pub async fn ensure_ready(&self) -> Result<&DB, StoreError> {
        self.db
            .get_or_try_init(|| async { Self::open(&self.config) })
            .await
    }

    /// Whether the database has been opened.
    pub fn is_ready(&self) -> bool {
        self.db.initialized()
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn open(config: &StoreConfig) -> Result<DB, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(2);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened offline store at {}", config.path.display());
        Ok(db)
    }

    /// Write a batch honoring `sync_writes`.
    pub(crate) fn write(&self, db: &DB, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

/// Get a column family handle.
pub(crate) fn cf<'a>(db: &'a DB, name: &str) -> Result<&'a rocksdb::ColumnFamily, StoreError> {
    db.cf_handle(name)
        .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
}

/// Milliseconds since the Unix epoch from the local clock.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
