//! Main SyncEngine - binds identity, store, discovery, and sessions
//!
//! Data flow:
//!
//! ```text
//! local write → store → change callback → broadcast to sessions
//!                                              │
//! remote device ── sync_data ──▶ session ──▶ apply (LWW, version kept)
//!                                              │
//!                                 change callback → suppressed, no echo
//! ```
//!
//! Echo suppression: before a remote change is applied, its
//! `(table, id, version)` triple is remembered; the store change callback
//! consumes the triple instead of broadcasting, so an applied change is
//! never re-emitted with the same version.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::discovery::{DiscoveryManager, Peer};
use crate::error::SyncResult;
use crate::identity::DeviceIdentity;
use crate::store::{MemoryStore, Record, RecordStore};
use crate::sync::{SyncData, SyncManager, SyncOp};

/// Capacity of the echo-suppression window
const RECENT_CAPACITY: usize = 1024;

/// Key of one applied remote mutation
type AppliedKey = (String, String, i64);

/// Bounded FIFO set of recently applied remote changes
struct RecentlyApplied {
    entries: HashSet<AppliedKey>,
    order: VecDeque<AppliedKey>,
}

impl RecentlyApplied {
    fn new() -> Self {
        Self {
            entries: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn remember(&mut self, key: AppliedKey) {
        if self.entries.insert(key.clone()) {
            self.order.push_back(key);
            while self.order.len() > RECENT_CAPACITY {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
        }
    }

    fn take(&mut self, key: &AppliedKey) -> bool {
        self.entries.remove(key)
    }
}

/// Snapshot of engine health for the status surface
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub device_name: String,
    pub account_id: String,
    /// Open sessions
    pub connections: usize,
    /// Distinct accounts seen on the LAN
    pub peers: usize,
    pub data_dir: std::path::PathBuf,
}

/// The synchronization engine.
///
/// # Example
///
/// ```ignore
/// use myspace_sync_core::{SyncConfig, SyncEngine};
///
/// let config = SyncConfig::new("./data", "laptop");
/// let engine = SyncEngine::new(config)?;
/// engine.start().await?;
///
/// let mut data = serde_json::Map::new();
/// data.insert("title".into(), "first entry".into());
/// engine.records().create("diary_entries", "entry-1", data)?;
/// ```
pub struct SyncEngine {
    config: SyncConfig,
    identity: Arc<DeviceIdentity>,
    store: Arc<dyn RecordStore>,
    discovery: Arc<DiscoveryManager>,
    sessions: Arc<SyncManager>,
    recently_applied: Arc<Mutex<RecentlyApplied>>,
    server_addr: Mutex<Option<SocketAddr>>,
}

impl SyncEngine {
    /// Create an engine: loads (or creates) the identity and builds the
    /// component stack. Nothing touches the network until [`start`](Self::start).
    pub fn new(config: SyncConfig) -> SyncResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let identity = Arc::new(DeviceIdentity::load_or_create(&config.data_dir)?);
        info!(
            device = %config.device_name,
            account_id = %identity.account_id(),
            "Initializing sync engine"
        );

        let sessions = Arc::new(SyncManager::new(identity.clone(), &config.device_name));
        let discovery = Arc::new(DiscoveryManager::new(
            identity.account_id(),
            &config.device_name,
            config.sync_port,
        ));

        Ok(Self {
            config,
            identity,
            store: Arc::new(MemoryStore::new()),
            discovery,
            sessions,
            recently_applied: Arc::new(Mutex::new(RecentlyApplied::new())),
            server_addr: Mutex::new(None),
        })
    }

    /// Swap in a different record backend (before `start`)
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = store;
        self
    }

    /// Wire the callback pipeline, bind the sync server, and start
    /// discovery (when enabled). Returns the server's bound address.
    pub async fn start(&self) -> SyncResult<SocketAddr> {
        self.wire_discovery();
        self.wire_inbound();
        self.wire_outbound();

        let addr = self.sessions.start_server(self.config.sync_port).await?;
        *self.server_addr.lock() = Some(addr);

        if self.config.discovery {
            self.discovery.start()?;
        }

        info!(%addr, device = %self.config.device_name, "Sync engine started");
        Ok(addr)
    }

    /// Stop discovery and tear down every session and the server
    pub fn stop(&self) {
        info!("Stopping sync engine");
        self.discovery.stop();
        self.sessions.shutdown();
    }

    /// Discovery events: dial every newly seen same-account device
    fn wire_discovery(&self) {
        let identity = self.identity.clone();
        let sessions = self.sessions.clone();

        self.discovery.on_peer_discovered(Arc::new(move |peer: &Peer| {
            if !identity.is_same_account(&peer.account_id) {
                info!(account_id = %peer.account_id, "Ignoring device from different account");
                return;
            }
            if sessions.is_connected(&peer.account_id) {
                debug!(device = %peer.device_name, "Session already open");
                return;
            }

            info!(
                device = %peer.device_name,
                address = %peer.address,
                "Found same-account device"
            );
            let sessions = sessions.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                if let Err(e) = sessions.connect(peer.address, &peer.device_name).await {
                    warn!(device = %peer.device_name, error = %e, "Failed to connect");
                }
            });
        }));
    }

    /// Inbound sync payloads: apply with the sender's version under LWW
    fn wire_inbound(&self) {
        let store = self.store.clone();
        let recent = self.recently_applied.clone();

        self.sessions.on_sync_data(Arc::new(move |payload: &SyncData| {
            let key = (
                payload.table.clone(),
                payload.record_id.clone(),
                payload.version,
            );

            // Mark first so the store change callback sees the triple.
            recent.lock().remember(key.clone());

            let result = store.apply(
                payload.operation,
                &payload.table,
                &payload.record_id,
                payload.data.clone(),
                payload.version,
            );
            match result {
                Ok(Some(_)) => {}
                Ok(None) => {
                    recent.lock().take(&key);
                    debug!(
                        table = %payload.table,
                        record_id = %payload.record_id,
                        version = payload.version,
                        "Stale remote change skipped"
                    );
                }
                Err(e) => {
                    recent.lock().take(&key);
                    // A peer may legitimately re-broadcast; not fatal.
                    warn!(
                        table = %payload.table,
                        record_id = %payload.record_id,
                        error = %e,
                        "Failed to apply remote change"
                    );
                }
            }
        }));
    }

    /// Local store changes: translate to sync payloads and broadcast,
    /// unless the change is the echo of a remote apply
    fn wire_outbound(&self) {
        let sessions = self.sessions.clone();
        let recent = self.recently_applied.clone();

        self.store.subscribe(Arc::new(move |record: &Record| {
            let key = (record.table.clone(), record.id.clone(), record.version);
            if recent.lock().take(&key) {
                debug!(
                    table = %record.table,
                    record_id = %record.id,
                    version = record.version,
                    "Suppressing echo of remote change"
                );
                return;
            }

            let payload = SyncData {
                operation: operation_for(record),
                table: record.table.clone(),
                record_id: record.id.clone(),
                data: record.data.clone(),
                version: record.version,
            };
            if let Err(e) = sessions.broadcast(&payload) {
                warn!(
                    table = %record.table,
                    record_id = %record.id,
                    error = %e,
                    "Failed to broadcast change"
                );
            }
        }));
    }

    /// The record store of this engine
    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Account id of this device
    pub fn account_id(&self) -> &str {
        self.identity.account_id()
    }

    /// Address the sync server is bound to, once started
    pub fn server_addr(&self) -> Option<SocketAddr> {
        *self.server_addr.lock()
    }

    /// Dial a peer directly, outside of discovery (tests, static peers)
    pub async fn connect(&self, addr: SocketAddr) -> SyncResult<()> {
        self.sessions.connect(addr, "static-peer").await
    }

    /// Status snapshot for the periodic log and any UI
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            device_name: self.config.device_name.clone(),
            account_id: self.identity.account_id().to_string(),
            connections: self.sessions.connection_count(),
            peers: self.discovery.peer_count(),
            data_dir: self.config.data_dir.clone(),
        }
    }

    /// The engine's data directory
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }
}

/// Classify a record change for the wire
fn operation_for(record: &Record) -> SyncOp {
    if record.deleted_at.is_some() {
        SyncOp::Delete
    } else if record.created_at == record.updated_at {
        SyncOp::Create
    } else {
        SyncOp::Update
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recently_applied_take_consumes_once() {
        let mut recent = RecentlyApplied::new();
        let key = ("t".to_string(), "a".to_string(), 1);

        recent.remember(key.clone());
        assert!(recent.take(&key));
        assert!(!recent.take(&key));
    }

    #[test]
    fn test_recently_applied_evicts_oldest() {
        let mut recent = RecentlyApplied::new();
        for version in 0..(RECENT_CAPACITY as i64 + 10) {
            recent.remember(("t".to_string(), "a".to_string(), version));
        }

        assert!(!recent.take(&("t".to_string(), "a".to_string(), 0)));
        assert!(recent.take(&(
            "t".to_string(),
            "a".to_string(),
            RECENT_CAPACITY as i64 + 9
        )));
    }

    #[test]
    fn test_operation_classification() {
        let mut record = Record {
            table: "t".to_string(),
            id: "a".to_string(),
            data: Default::default(),
            version: 1,
            created_at: 100,
            updated_at: 100,
            deleted_at: None,
        };
        assert_eq!(operation_for(&record), SyncOp::Create);

        record.updated_at = 101;
        assert_eq!(operation_for(&record), SyncOp::Update);

        record.deleted_at = Some(101);
        assert_eq!(operation_for(&record), SyncOp::Delete);
    }
}
