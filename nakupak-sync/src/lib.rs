//! # nakupak-sync — Offline-tolerant sync engine for the nakupak shopping list
//!
//! Keeps a shared household shopping list usable on a device that drops in
//! and out of connectivity, while other devices edit the same server state.
//!
//! ## Architecture
//!
//! ```text
//!   user action
//!       │
//!       ▼
//! ┌────────────────┐  apply   ┌───────────────────────┐
//! │ MutationEngine │ ───────► │ SessionStore/ListStore│ ◄── refetch ──┐
//! └───────┬────────┘          └───────────────────────┘               │
//!         │ call                                                      │
//!         ▼                                                           │
//! ┌────────────────┐  failed toggle  ┌────────────┐       ┌───────────┴─────┐
//! │ RemoteGateway  │ ──────────────► │ QueueStore │       │ RealtimeChannel │
//! └────────────────┘                 └─────┬──────┘       │ (list_updated)  │
//!         ▲                                │              └─────────────────┘
//!         │           replay FIFO          │                      ▲
//!         └────────── ConnectivityCoordinator ────── connect() ───┘
//!                         ▲
//!                  NetworkStatus (NetworkMonitor)
//! ```
//!
//! ## Modules
//!
//! - [`config`] — Client configuration and environment overrides
//! - [`model`] — Entities as served by the REST API
//! - [`protocol`] — Realtime event frames
//! - [`gateway`] — REST client trait, reqwest implementation, credentials
//! - [`storage`] — RocksDB-backed action queue and session snapshots
//! - [`state`] — In-memory session and list stores
//! - [`mutation`] — Optimistic mutations with queue or rollback on failure
//! - [`realtime`] — WebSocket channel with fixed-delay reconnect
//! - [`connectivity`] — Online/offline handling and queue replay
//! - [`network`] — Reachability checks for native hosts
//! - [`engine`] — Composition root

pub mod config;
pub mod connectivity;
pub mod engine;
pub mod gateway;
pub mod model;
pub mod mutation;
pub mod network;
pub mod protocol;
pub mod realtime;
pub mod state;
pub mod storage;

// Re-exports for convenience
pub use config::{ClientConfig, ConfigError};
pub use connectivity::{ConnectionState, ConnectivityCoordinator, NetworkStatus, ReplayReport};
pub use engine::{SyncEngine, SyncError};
pub use gateway::{Credentials, GatewayError, HttpGateway, RemoteGateway};
pub use model::{
    ActiveSession, Category, CheckState, EntityId, Item, ListItem, NewListEntry, SessionItem,
};
pub use mutation::{MutationEngine, MutationEvent, MutationKind, MutationOutcome, MutationPhase};
pub use network::NetworkMonitor;
pub use protocol::{ProtocolError, ServerEvent};
pub use realtime::{
    ChannelError, ChannelStatus, InvalidationSubscriber, ListRefresher, RealtimeChannel,
};
pub use state::{ListStore, SessionStore};
pub use storage::{
    LocalStore, PendingAction, QueueStore, QueuedAction, SnapshotCache, SnapshotMetadata,
    StoreConfig, StoreError,
};
