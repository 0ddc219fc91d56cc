//! Process-wide session ownership.
//!
//! Maps live PTY session ids to the device id that created them. The mapping
//! outlives any single WebSocket connection: a device that disconnects and
//! reconnects with the same id is re-associated with its sessions during the
//! auth handshake. Entries are claimed on create and released on close or
//! PTY exit, never by connection teardown.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

/// Cloneable handle to the ownership map. All clones share the same state.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    owners: Arc<RwLock<HashMap<String, String>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `device_id` owns `session_id`. Overwrites any prior claim.
    pub async fn claim(&self, session_id: &str, device_id: &str) {
        self.owners
            .write()
            .await
            .insert(session_id.to_string(), device_id.to_string());
    }

    /// The owning device of a session, if any.
    pub async fn owner(&self, session_id: &str) -> Option<String> {
        self.owners.read().await.get(session_id).cloned()
    }

    /// Drop the ownership entry for a session (close or exit).
    pub async fn release(&self, session_id: &str) {
        self.owners.write().await.remove(session_id);
    }

    /// All session ids currently owned by a device.
    pub async fn sessions_owned_by(&self, device_id: &str) -> Vec<String> {
        self.owners
            .read()
            .await
            .iter()
            .filter(|(_, owner)| owner.as_str() == device_id)
            .map(|(id, _)| id.clone())
            .collect()
    }
}
