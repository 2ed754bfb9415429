//! Configuration for a sync engine instance.
//!
//! # Example
//!
//! ```rust
//! use myspace_sync_core::SyncConfig;
//!
//! let config = SyncConfig::new("./data", "laptop")
//!     .with_sync_port(9090);
//! ```

use std::path::PathBuf;

/// Default TCP port for sync sessions
pub const DEFAULT_SYNC_PORT: u16 = 8080;

/// Configuration for a [`SyncEngine`](crate::SyncEngine).
///
/// # Defaults
///
/// - `sync_port`: 8080
/// - `discovery`: enabled
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Directory holding the identity file and any durable state.
    ///
    /// Created with owner-only permissions if it doesn't exist.
    pub data_dir: PathBuf,

    /// Human-readable name for this device.
    ///
    /// Announced over mDNS and embedded in handshake assertions.
    pub device_name: String,

    /// TCP port the sync server listens on and advertises.
    pub sync_port: u16,

    /// Whether to announce/browse on the local network.
    ///
    /// Disabled for local-only operation (and for tests that wire
    /// peers together explicitly).
    pub discovery: bool,
}

impl SyncConfig {
    /// Create a configuration with the given data directory and device name
    pub fn new(data_dir: impl Into<PathBuf>, device_name: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            device_name: device_name.into(),
            sync_port: DEFAULT_SYNC_PORT,
            discovery: true,
        }
    }

    /// Set the sync server port
    #[must_use]
    pub fn with_sync_port(mut self, port: u16) -> Self {
        self.sync_port = port;
        self
    }

    /// Enable or disable LAN discovery
    #[must_use]
    pub fn with_discovery(mut self, enabled: bool) -> Self {
        self.discovery = enabled;
        self
    }

    /// Path to the identity file inside the data directory
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.json")
    }
}
