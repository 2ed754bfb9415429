//! LAN peer discovery over mDNS/DNS-SD
//!
//! Announces this device under `_myspace-sync._tcp.local.` with the
//! account id and device name in TXT records, and browses for other
//! announcements. Same-service entries become [`Peer`]s; the engine
//! decides (by account id) which of them to dial.
//!
//! Announcements from this very device (matching account id AND device
//! name) are suppressed so a host never dials itself.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

/// DNS-SD service type for sync peers
pub const SERVICE_TYPE: &str = "_myspace-sync._tcp.local.";

/// Announced protocol version
const TXT_VERSION: &str = "1.0";

/// A same-service device observed on the LAN
#[derive(Debug, Clone)]
pub struct Peer {
    /// Account the device announced
    pub account_id: String,
    /// Device name the device announced
    pub device_name: String,
    /// Sync server address (first IPv4 if any, else first IPv6)
    pub address: SocketAddr,
    /// Unix seconds of the latest announcement
    pub last_seen: i64,
}

/// Callback invoked with every accepted peer announcement
pub type PeerCallback = Arc<dyn Fn(&Peer) + Send + Sync>;

/// Shared state the browser task updates
struct BrowserState {
    account_id: String,
    device_name: String,
    peers: RwLock<HashMap<String, Peer>>,
    callbacks: RwLock<Vec<PeerCallback>>,
}

impl BrowserState {
    /// Convert one resolved service entry into a peer, if acceptable
    fn handle_entry(&self, entry: &ServiceInfo) {
        let Some(account_id) = entry.get_property_val_str("account_id") else {
            info!(service = %entry.get_fullname(), "Ignoring announcement without account_id");
            return;
        };
        let device_name = entry.get_property_val_str("device_name").unwrap_or_default();

        // Our own announcement comes back from the daemon too.
        if account_id == self.account_id && device_name == self.device_name {
            return;
        }

        let addresses = entry.get_addresses();
        let Some(ip) = addresses
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addresses.iter().find(|a| a.is_ipv6()))
            .copied()
        else {
            debug!(service = %entry.get_fullname(), "Announcement carries no address");
            return;
        };

        let peer = Peer {
            account_id: account_id.to_string(),
            device_name: device_name.to_string(),
            address: SocketAddr::new(ip, entry.get_port()),
            last_seen: Utc::now().timestamp(),
        };

        debug!(
            device = %peer.device_name,
            address = %peer.address,
            account_id = %peer.account_id,
            "Discovered device"
        );

        // Latest announcement wins for an account id.
        self.peers
            .write()
            .insert(peer.account_id.clone(), peer.clone());

        for callback in self.callbacks.read().iter() {
            callback(&peer);
        }
    }
}

/// Announces this device and watches for peers.
pub struct DiscoveryManager {
    port: u16,
    state: Arc<BrowserState>,
    daemon: Mutex<Option<ServiceDaemon>>,
    fullname: Mutex<Option<String>>,
    browser: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryManager {
    pub fn new(account_id: impl Into<String>, device_name: impl Into<String>, port: u16) -> Self {
        Self {
            port,
            state: Arc::new(BrowserState {
                account_id: account_id.into(),
                device_name: device_name.into(),
                peers: RwLock::new(HashMap::new()),
                callbacks: RwLock::new(Vec::new()),
            }),
            daemon: Mutex::new(None),
            fullname: Mutex::new(None),
            browser: Mutex::new(None),
        }
    }

    /// Register a callback for accepted peer announcements.
    ///
    /// Callbacks are configured once at startup, before `start`.
    pub fn on_peer_discovered(&self, callback: PeerCallback) {
        self.state.callbacks.write().push(callback);
    }

    /// Register the advertisement and launch the browser task.
    ///
    /// A registration failure is fatal to startup.
    pub fn start(&self) -> SyncResult<()> {
        let daemon = ServiceDaemon::new().map_err(|e| SyncError::Discovery(e.to_string()))?;

        let mut txt = HashMap::new();
        txt.insert("account_id".to_string(), self.state.account_id.clone());
        txt.insert("device_name".to_string(), self.state.device_name.clone());
        txt.insert("version".to_string(), TXT_VERSION.to_string());

        let host = format!("{}.local.", self.state.device_name);
        let advertisement = ServiceInfo::new(
            SERVICE_TYPE,
            &self.state.device_name,
            &host,
            "",
            self.port,
            txt,
        )
        .map_err(|e| SyncError::Discovery(e.to_string()))?
        .enable_addr_auto();

        *self.fullname.lock() = Some(advertisement.get_fullname().to_string());
        daemon
            .register(advertisement)
            .map_err(|e| SyncError::Discovery(e.to_string()))?;

        let receiver = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| SyncError::Discovery(e.to_string()))?;

        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv_async().await {
                    Ok(ServiceEvent::ServiceResolved(entry)) => state.handle_entry(&entry),
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "Browse channel closed");
                        break;
                    }
                }
            }
        });

        *self.daemon.lock() = Some(daemon);
        *self.browser.lock() = Some(handle);

        info!(
            device = %self.state.device_name,
            account_id = %self.state.account_id,
            port = self.port,
            "Discovery started"
        );
        Ok(())
    }

    /// Withdraw the advertisement and cancel the browser.
    ///
    /// Browse results still in flight are dropped with the channel.
    pub fn stop(&self) {
        if let Some(handle) = self.browser.lock().take() {
            handle.abort();
        }

        if let Some(daemon) = self.daemon.lock().take() {
            if let Err(e) = daemon.stop_browse(SERVICE_TYPE) {
                debug!(error = %e, "stop_browse failed");
            }
            if let Some(fullname) = self.fullname.lock().take() {
                if let Err(e) = daemon.unregister(&fullname) {
                    warn!(error = %e, "Failed to withdraw advertisement");
                }
            }
            let _ = daemon.shutdown();
        }

        info!("Discovery stopped");
    }

    /// Snapshot of the peers observed so far
    pub fn peers(&self) -> Vec<Peer> {
        self.state.peers.read().values().cloned().collect()
    }

    /// Number of distinct accounts observed
    pub fn peer_count(&self) -> usize {
        self.state.peers.read().len()
    }
}
