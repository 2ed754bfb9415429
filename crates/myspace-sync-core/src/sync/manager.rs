//! Session manager: accepting, dialing, and broadcasting
//!
//! Maintains the mesh of authenticated sessions with same-account peers.
//! The accepting side serves a WebSocket upgrade on `/ws`; the dialing
//! side connects on discovery. Both run the same handshake:
//!
//! ```text
//! DIALED ──send handshake──▶ AWAIT_RESP ──valid response──▶ OPEN
//!    │                           │                            │
//!    └── dial error ──▶ CLOSED   └─ invalid/timeout ─▶ CLOSED │
//!                                     ──read/write error──▶ CLOSED
//! ```
//!
//! Each session gets one reader task and one writer task; writes from any
//! task go through the session's queue. The connection map is keyed by the
//! peer's account id and a re-handshake replaces the previous session,
//! whose reader observes the close and cleans up after itself.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::identity::{DeviceAssertion, DeviceIdentity};
use crate::sync::protocol::{MessageType, SyncData, SyncMessage};
use crate::sync::session::Session;

/// Bound on waiting for the peer's half of the handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Callback invoked with every inbound `sync_data` payload
pub type SyncDataCallback = Arc<dyn Fn(&SyncData) + Send + Sync>;

/// Manager of authenticated peer sessions.
///
/// Cheap to share: clones of the inner state are held by the server task
/// and every session task.
pub struct SyncManager {
    inner: Arc<ManagerInner>,
    server: Mutex<Option<JoinHandle<()>>>,
}

struct ManagerInner {
    identity: Arc<DeviceIdentity>,
    device_name: String,
    connections: RwLock<HashMap<String, Arc<Session>>>,
    callbacks: RwLock<Vec<SyncDataCallback>>,
}

impl SyncManager {
    pub fn new(identity: Arc<DeviceIdentity>, device_name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                identity,
                device_name: device_name.into(),
                connections: RwLock::new(HashMap::new()),
                callbacks: RwLock::new(Vec::new()),
            }),
            server: Mutex::new(None),
        }
    }

    /// Register a callback for inbound sync payloads.
    ///
    /// Callbacks are configured once at startup, before sessions exist.
    pub fn on_sync_data(&self, callback: SyncDataCallback) {
        self.inner.callbacks.write().push(callback);
    }

    /// Bind the sync server and start accepting connections on `/ws`.
    ///
    /// Returns the bound address (useful with port 0). A bind failure is
    /// fatal to startup.
    pub async fn start_server(&self, port: u16) -> SyncResult<SocketAddr> {
        let app = Router::new()
            .route("/ws", get(ws_handler))
            .with_state(self.inner.clone());

        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| SyncError::ServerBind(e.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| SyncError::ServerBind(e.to_string()))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "Sync server terminated");
            }
        });
        *self.server.lock() = Some(handle);

        info!(%addr, "Sync server listening");
        Ok(addr)
    }

    /// Dial a peer and run the handshake.
    ///
    /// On success the session is OPEN and registered under the peer's
    /// account id; failures are scoped to this one peer.
    pub async fn connect(&self, addr: SocketAddr, device_name: &str) -> SyncResult<()> {
        let url = format!("ws://{addr}/ws");
        debug!(%url, "Dialing peer");

        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SyncError::DialFailed(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        let assertion = self.inner.identity.sign_assertion(&self.inner.device_name);
        let hello = SyncMessage::handshake(&assertion)?.encode()?;
        sink.send(TungsteniteMessage::Text(hello))
            .await
            .map_err(|e| SyncError::WriteFailed(e.to_string()))?;

        let reply = timeout(HANDSHAKE_TIMEOUT, stream.next())
            .await
            .map_err(|_| SyncError::HandshakeFailed("response timed out".to_string()))?
            .ok_or_else(|| {
                SyncError::HandshakeFailed("connection closed during handshake".to_string())
            })?
            .map_err(|e| SyncError::ReadFailed(e.to_string()))?;
        let text = match reply {
            TungsteniteMessage::Text(text) => text,
            _ => {
                return Err(SyncError::HandshakeFailed(
                    "non-text handshake response".to_string(),
                ))
            }
        };

        let response = SyncMessage::decode(&text)?;
        if response.kind != MessageType::HandshakeResponse {
            return Err(SyncError::HandshakeFailed(format!(
                "expected handshake_response, got {}",
                response.kind.as_str()
            )));
        }
        if !self.inner.identity.is_same_account(&response.account_id) {
            return Err(SyncError::HandshakeFailed(
                "peer belongs to a different account".to_string(),
            ));
        }

        let (session, mut outbound_rx) = self
            .inner
            .open_session(&response.account_id, device_name);
        info!(peer = %device_name, "Session open (outgoing)");

        // Writer: drains the queue, closes the socket when it ends.
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if sink.send(TungsteniteMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader task for this session.
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.wait_closed() => {
                        debug!(peer = %session.account_id(), "Session closed locally");
                        break;
                    }
                    frame = stream.next() => {
                        match frame {
                            Some(Ok(TungsteniteMessage::Text(text))) => {
                                inner.handle_frame(&session, &text);
                            }
                            Some(Ok(TungsteniteMessage::Close(_))) | None => {
                                debug!(peer = %session.account_id(), "Peer closed connection");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(peer = %session.account_id(), error = %e, "Read failed");
                                break;
                            }
                        }
                    }
                }
            }
            inner.remove_session(&session);
        });

        Ok(())
    }

    /// Send one mutation to every open session.
    ///
    /// The frame is serialized and signed once. A peer whose queue is gone
    /// is logged and skipped; its own read path closes the session. Returns
    /// Ok as long as serialization succeeded.
    pub fn broadcast(&self, payload: &SyncData) -> SyncResult<()> {
        let text = SyncMessage::sync_data(&self.inner.identity, payload)?.encode()?;

        let connections = self.inner.connections.read();
        for (account_id, session) in connections.iter() {
            if session.send(text.clone()).is_err() {
                warn!(peer = %account_id, "Failed to queue frame for peer");
            }
        }
        Ok(())
    }

    /// Account ids with an open session
    pub fn connections(&self) -> Vec<String> {
        self.inner.connections.read().keys().cloned().collect()
    }

    /// Number of open sessions
    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    /// Whether a session for this account is currently open
    pub fn is_connected(&self, account_id: &str) -> bool {
        self.inner.connections.read().contains_key(account_id)
    }

    /// Stop the server and close every session
    pub fn shutdown(&self) {
        if let Some(handle) = self.server.lock().take() {
            handle.abort();
        }

        let sessions: Vec<Arc<Session>> = {
            let mut connections = self.inner.connections.write();
            connections.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.close();
        }
        info!("Sync manager shut down");
    }
}

impl ManagerInner {
    /// Create a session and register it, replacing (and closing) any
    /// previous session for the same account
    fn open_session(
        &self,
        account_id: &str,
        device_name: &str,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(account_id, device_name, tx));

        if let Some(previous) = self
            .connections
            .write()
            .insert(account_id.to_string(), session.clone())
        {
            debug!(account_id, "Replacing existing session");
            previous.close();
        }

        (session, rx)
    }

    /// Drop a session from the map, unless it was already replaced
    fn remove_session(&self, session: &Arc<Session>) {
        let mut connections = self.connections.write();
        if let Some(current) = connections.get(session.account_id()) {
            if Arc::ptr_eq(current, session) {
                connections.remove(session.account_id());
                info!(peer = %session.device_name(), "Session closed");
            }
        }
    }

    /// Validate the opening frame of an incoming connection
    fn verify_handshake(&self, text: &str) -> SyncResult<DeviceAssertion> {
        let message = SyncMessage::decode(text)?;
        if message.kind != MessageType::Handshake {
            return Err(SyncError::HandshakeFailed(format!(
                "expected handshake, got {}",
                message.kind.as_str()
            )));
        }

        let assertion = message.assertion()?;
        assertion.verify()?;

        // A valid assertion for some other account is still useless here;
        // sessions only ever exist between devices of one account.
        if !self.identity.is_same_account(&assertion.account_id) {
            return Err(SyncError::HandshakeFailed(
                "peer belongs to a different account".to_string(),
            ));
        }

        Ok(assertion)
    }

    /// Dispatch one inbound text frame on an OPEN session.
    ///
    /// Malformed frames, frames from foreign accounts, and frames with a
    /// bad signature are dropped with a log line; the session stays open.
    fn handle_frame(&self, session: &Arc<Session>, text: &str) {
        let message = match SyncMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %session.account_id(), error = %e, "Dropping malformed frame");
                return;
            }
        };

        if message.account_id != self.identity.account_id() {
            warn!(
                account_id = %message.account_id,
                "Dropping frame from foreign account"
            );
            return;
        }

        match message.kind {
            MessageType::SyncData => {
                if let Err(e) = message.verify_signature(self.identity.verifying_key()) {
                    warn!(peer = %session.account_id(), error = %e, "Dropping badly signed frame");
                    return;
                }
                let payload = match message.sync_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(peer = %session.account_id(), error = %e, "Dropping bad sync payload");
                        return;
                    }
                };

                debug!(
                    op = ?payload.operation,
                    table = %payload.table,
                    record_id = %payload.record_id,
                    version = payload.version,
                    "Received sync data"
                );
                for callback in self.callbacks.read().iter() {
                    callback(&payload);
                }
                session.touch();
            }
            other => {
                debug!(kind = other.as_str(), "Ignoring frame");
            }
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(inner): State<Arc<ManagerInner>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_incoming(socket, inner))
}

/// Accept path: handshake on the first frame, then the session read loop
async fn handle_incoming(socket: WebSocket, inner: Arc<ManagerInner>) {
    let (mut sink, mut stream) = socket.split();

    let first = match timeout(HANDSHAKE_TIMEOUT, stream.next()).await {
        Ok(Some(Ok(WsMessage::Text(text)))) => text,
        Ok(Some(Err(e))) => {
            debug!(error = %e, "Connection failed before handshake");
            return;
        }
        Ok(_) => {
            debug!("Connection closed before handshake");
            return;
        }
        Err(_) => {
            debug!("Handshake timed out");
            return;
        }
    };

    let assertion = match inner.verify_handshake(&first) {
        Ok(assertion) => assertion,
        Err(e) => {
            warn!(error = %e, "Rejected handshake");
            let _ = sink.close().await;
            return;
        }
    };

    let response = SyncMessage::handshake_response(inner.identity.account_id());
    let body = match response.encode() {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "Failed to encode handshake response");
            return;
        }
    };
    if sink.send(WsMessage::Text(body)).await.is_err() {
        warn!(peer = %assertion.device_name, "Failed to send handshake response");
        return;
    }

    let (session, mut outbound_rx) =
        inner.open_session(&assertion.account_id, &assertion.device_name);
    info!(peer = %assertion.device_name, "Session open (incoming)");

    // Writer: drains the queue, closes the socket when it ends.
    tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            _ = session.wait_closed() => {
                debug!(peer = %session.account_id(), "Session closed locally");
                break;
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        inner.handle_frame(&session, &text);
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        debug!(peer = %session.account_id(), "Peer closed connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(peer = %session.account_id(), error = %e, "Read failed");
                        break;
                    }
                }
            }
        }
    }
    inner.remove_session(&session);
}
