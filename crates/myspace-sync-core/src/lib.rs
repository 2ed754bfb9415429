//! MySpace Sync Core Library
//!
//! Peer-to-peer LAN synchronization for a personal-data application.
//!
//! ## Overview
//!
//! Each device owns an Ed25519 identity; devices provisioned from the same
//! identity file form one account. Same-account devices find each other via
//! mDNS, establish authenticated WebSocket sessions, and converge a set of
//! soft-deleted, versioned records under last-writer-wins by version.
//!
//! - **Local-first**: every mutation lands in the local store immediately
//! - **No coordinator**: devices announce and dial each other directly
//! - **Convergent**: numeric versions decide conflicts, tombstones persist
//!
//! ## Quick Start
//!
//! ```ignore
//! use myspace_sync_core::{SyncConfig, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = SyncEngine::new(SyncConfig::new("./data", "laptop"))?;
//!     engine.start().await?;
//!
//!     let mut entry = serde_json::Map::new();
//!     entry.insert("title".into(), "first entry".into());
//!     engine.records().create("diary_entries", "entry-1", entry)?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod identity;
pub mod store;
pub mod sync;

// Re-exports
pub use config::{SyncConfig, DEFAULT_SYNC_PORT};
pub use discovery::{DiscoveryManager, Peer, SERVICE_TYPE};
pub use engine::{EngineStatus, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use identity::{DeviceAssertion, DeviceIdentity};
pub use store::{Clock, MemoryStore, Record, RecordData, RecordStore, SystemClock, VersionClock};
pub use sync::{MessageType, SyncData, SyncManager, SyncMessage, SyncOp};
