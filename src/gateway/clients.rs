//! Connected-client table.
//!
//! One [`ClientHandle`] per authenticated WebSocket connection. Outbound
//! frames go through a bounded per-client queue drained by the connection's
//! writer task, so a slow client never blocks a PTY read loop or another
//! client's delivery; a fan-out that finds the queue full disconnects the
//! client instead of waiting. Disconnects are signalled through a watch
//! channel observed by the connection's read loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

/// Outbound queue depth per client. Overflow means the client cannot keep up
/// with its subscriptions and is disconnected.
pub const SEND_QUEUE_DEPTH: usize = 256;

/// One authenticated connection.
pub struct ClientHandle {
    /// Server-assigned connection id.
    pub id: String,
    /// Client-chosen stable device id; the unit of session ownership.
    pub device_id: String,
    pub device_name: String,
    /// Milliseconds since epoch at auth success.
    pub authenticated_at: u64,
    /// Peer address was loopback.
    pub is_local: bool,
    /// Sessions whose output this client receives.
    pub session_subscriptions: HashSet<String>,
    /// Sessions attributed to this connection's device id at auth/create
    /// time. May lag the global ownership map until the next handshake.
    pub owned_sessions: HashSet<String>,
    /// Services whose stdout/stderr this client receives.
    pub service_subscriptions: HashSet<String>,
    sender: mpsc::Sender<Message>,
    disconnect: watch::Sender<bool>,
}

impl ClientHandle {
    pub fn new(
        id: String,
        device_id: String,
        device_name: String,
        authenticated_at: u64,
        is_local: bool,
        sender: mpsc::Sender<Message>,
        disconnect: watch::Sender<bool>,
    ) -> Self {
        Self {
            id,
            device_id,
            device_name,
            authenticated_at,
            is_local,
            session_subscriptions: HashSet::new(),
            owned_sessions: HashSet::new(),
            service_subscriptions: HashSet::new(),
            sender,
            disconnect,
        }
    }

    /// Whether this client may write/resize/close the session.
    pub fn may_operate(&self, session_id: &str) -> bool {
        self.is_local
            || self.owned_sessions.contains(session_id)
            || self.session_subscriptions.contains(session_id)
    }

    /// Whether this client may subscribe to the session's output.
    pub fn may_subscribe(&self, session_id: &str) -> bool {
        self.is_local || self.owned_sessions.contains(session_id)
    }

    /// A delivery endpoint usable outside the table lock.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            conn_id: self.id.clone(),
            sender: self.sender.clone(),
            disconnect: self.disconnect.clone(),
        }
    }

    /// Ask the connection to shut down.
    pub fn request_disconnect(&self) {
        let _ = self.disconnect.send(true);
    }
}

/// Snapshot of a client's send queue, taken under the lock and used after it
/// is released.
#[derive(Clone)]
pub struct Endpoint {
    pub conn_id: String,
    sender: mpsc::Sender<Message>,
    disconnect: watch::Sender<bool>,
}

impl Endpoint {
    /// Enqueue a frame without blocking. A full queue disconnects the client.
    pub fn deliver(&self, frame: &Value) {
        let text = match serde_json::to_string(frame) {
            Ok(t) => t,
            Err(e) => {
                warn!("Dropping unserializable frame: {e}");
                return;
            }
        };
        match self.sender.try_send(Message::Text(text)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Client {}: send queue overflow, disconnecting", self.conn_id);
                let _ = self.disconnect.send(true);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Shared table of authenticated clients. Cloneable handle.
#[derive(Clone, Default)]
pub struct ClientMap {
    inner: Arc<RwLock<HashMap<String, ClientHandle>>>,
}

impl ClientMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, client: ClientHandle) {
        self.inner.write().await.insert(client.id.clone(), client);
    }

    pub async fn remove(&self, conn_id: &str) {
        self.inner.write().await.remove(conn_id);
    }

    /// Run a closure against one client under the write lock.
    /// Returns `None` when the connection is gone.
    pub async fn with_client<R>(
        &self,
        conn_id: &str,
        f: impl FnOnce(&mut ClientHandle) -> R,
    ) -> Option<R> {
        self.inner.write().await.get_mut(conn_id).map(f)
    }

    /// Read-only view of one client.
    pub async fn get<R>(&self, conn_id: &str, f: impl FnOnce(&ClientHandle) -> R) -> Option<R> {
        self.inner.read().await.get(conn_id).map(f)
    }

    /// Endpoints of clients subscribed to a session.
    pub async fn session_subscribers(&self, session_id: &str) -> Vec<Endpoint> {
        self.inner
            .read()
            .await
            .values()
            .filter(|c| c.session_subscriptions.contains(session_id))
            .map(ClientHandle::endpoint)
            .collect()
    }

    /// Endpoints of clients subscribed to a service's output.
    pub async fn service_subscribers(&self, service_id: &str) -> Vec<Endpoint> {
        self.inner
            .read()
            .await
            .values()
            .filter(|c| c.service_subscriptions.contains(service_id))
            .map(ClientHandle::endpoint)
            .collect()
    }

    /// Endpoints of every authenticated client.
    pub async fn all(&self) -> Vec<Endpoint> {
        self.inner
            .read()
            .await
            .values()
            .map(ClientHandle::endpoint)
            .collect()
    }

    /// Endpoints of clients allowed to see lifecycle events for a session
    /// owned by `device_id`: local clients plus that device's connections.
    pub async fn visible_to_session(&self, device_id: &str, except_conn: &str) -> Vec<Endpoint> {
        self.inner
            .read()
            .await
            .values()
            .filter(|c| c.id != except_conn && (c.is_local || c.device_id == device_id))
            .map(ClientHandle::endpoint)
            .collect()
    }

    /// Signal every connection to shut down (gateway close).
    pub async fn disconnect_all(&self) {
        for client in self.inner.read().await.values() {
            client.request_disconnect();
        }
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }
}
