//! One authenticated connection to a peer device

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::error::{SyncError, SyncResult};

/// An open, handshake-authenticated session.
///
/// Frames queued via [`send`](Self::send) are drained by the session's
/// writer task, which serializes all writes on the underlying socket.
/// The reader task owns the receive half and observes [`close`](Self::close).
pub struct Session {
    account_id: String,
    device_name: String,
    outbound: mpsc::UnboundedSender<String>,
    last_seen: Mutex<i64>,
    closed: Notify,
}

impl Session {
    pub fn new(
        account_id: impl Into<String>,
        device_name: impl Into<String>,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            device_name: device_name.into(),
            outbound,
            last_seen: Mutex::new(Utc::now().timestamp()),
            closed: Notify::new(),
        }
    }

    /// Account id of the peer (the session map key)
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Device name the peer announced
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Queue a frame body for the writer task
    pub fn send(&self, text: String) -> SyncResult<()> {
        self.outbound
            .send(text)
            .map_err(|_| SyncError::WriteFailed("session is closed".to_string()))
    }

    /// Record inbound activity
    pub fn touch(&self) {
        *self.last_seen.lock() = Utc::now().timestamp();
    }

    /// Unix seconds of the last inbound message
    pub fn last_seen(&self) -> i64 {
        *self.last_seen.lock()
    }

    /// Ask the reader task to terminate (e.g. on replacement or shutdown).
    ///
    /// The single reader observes this via [`wait_closed`](Self::wait_closed);
    /// the stored permit makes close-before-wait race-free.
    pub fn close(&self) {
        self.closed.notify_one();
    }

    /// Resolves once [`close`](Self::close) has been called
    pub async fn wait_closed(&self) {
        self.closed.notified().await;
    }
}
