//! MySpace sync daemon
//!
//! Thin wrapper around myspace-sync-core: parses flags, initializes
//! logging, runs the engine until SIGINT/SIGTERM, and logs a status line
//! every 30 seconds.
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults (./data, host name, port 8080)
//! myspace-sync
//!
//! # Two devices of one account share the identity file
//! myspace-sync --data-dir /srv/sync --device-name study
//!
//! # Seed a demo diary entry for quick testing
//! myspace-sync --demo -v
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use myspace_sync_core::{SyncConfig, SyncEngine, DEFAULT_SYNC_PORT};

/// MySpace Sync - P2P LAN synchronization for personal records
#[derive(Parser)]
#[command(name = "myspace-sync")]
#[command(version)]
#[command(about = "P2P LAN synchronization daemon for personal records")]
struct Cli {
    /// Data directory (identity file lives here)
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Device name (default: host name)
    #[arg(long)]
    device_name: Option<String>,

    /// TCP port for sync sessions
    #[arg(long, default_value_t = DEFAULT_SYNC_PORT)]
    port: u16,

    /// Create a demo diary entry after startup
    #[arg(long)]
    demo: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

fn default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-device".to_string())
}

/// Resolves on SIGINT or SIGTERM
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).expect("cannot install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn seed_demo_entry(engine: &SyncEngine) {
    let mut data = serde_json::Map::new();
    data.insert("title".to_string(), "My first entry".into());
    data.insert(
        "content".to_string(),
        "A demo record for testing synchronization".into(),
    );
    data.insert(
        "date".to_string(),
        chrono::Utc::now().format("%Y-%m-%d").to_string().into(),
    );
    data.insert("tags".to_string(), serde_json::json!(["demo", "test"]));

    match engine.records().create("diary_entries", "demo-1", data) {
        Ok(record) => info!(version = record.version, "Created demo record"),
        Err(e) => warn!(error = %e, "Failed to create demo record"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let device_name = cli.device_name.unwrap_or_else(default_device_name);
    let config = SyncConfig::new(cli.data_dir, &device_name).with_sync_port(cli.port);

    let engine = SyncEngine::new(config)?;
    info!(
        device = %device_name,
        account_id = %engine.account_id(),
        "Starting sync engine"
    );
    engine.start().await?;

    if cli.demo {
        seed_demo_entry(&engine);
    }

    let mut status_ticker = tokio::time::interval(Duration::from_secs(30));
    status_ticker.tick().await; // first tick fires immediately

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received shutdown signal");
                break;
            }
            _ = status_ticker.tick() => {
                let status = engine.status();
                info!(
                    device = %status.device_name,
                    connections = status.connections,
                    peers = status.peers,
                    "Status"
                );
            }
        }
    }

    engine.stop();
    info!("Goodbye");
    Ok(())
}
