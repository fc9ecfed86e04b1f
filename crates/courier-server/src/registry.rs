//! Live socket registry.
//!
//! Maps an identity to its currently connected device sockets. Broadcast and
//! offline lookups take the read lock; connect and disconnect take the write
//! lock. The registry is process-local and owned by whoever builds the
//! server state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::Store;

/// A JSON text frame exchanged over the real-time socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketFrame {
    pub event: String,
    pub data: String,
}

impl SocketFrame {
    pub fn new(event: &str, data: impl Into<String>) -> Self {
        Self {
            event: event.to_string(),
            data: data.into(),
        }
    }
}

/// One connected device socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedSocket {
    pub socket_id: Uuid,
    pub session_id: String,
}

struct SocketEntry {
    socket: ConnectedSocket,
    tx: mpsc::Sender<SocketFrame>,
}

pub struct SessionRegistry {
    store: Store,
    sockets: RwLock<HashMap<String, Vec<SocketEntry>>>,
}

impl SessionRegistry {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            sockets: RwLock::new(HashMap::new()),
        }
    }

    /// Register a socket for `phone_full` and mark its session online.
    pub async fn connect(
        &self,
        phone_full: &str,
        session_id: &str,
        tx: mpsc::Sender<SocketFrame>,
    ) -> Uuid {
        let socket_id = Uuid::new_v4();
        let total = {
            let mut sockets = self.sockets.write().await;
            let entries = sockets.entry(phone_full.to_string()).or_default();
            entries.push(SocketEntry {
                socket: ConnectedSocket {
                    socket_id,
                    session_id: session_id.to_string(),
                },
                tx,
            });
            entries.len()
        };

        info!(user = phone_full, session = session_id, %socket_id, sockets = total, "Socket connected");

        if let Err(e) = self
            .store
            .call(|db| db.set_session_online(phone_full, session_id, true))
        {
            warn!(user = phone_full, session = session_id, error = %e, "Failed to mark session online");
        }
        socket_id
    }

    /// Remove a socket. An identity with no tracked sockets is logged and
    /// otherwise ignored.
    pub async fn disconnect(&self, phone_full: &str, socket_id: Uuid) {
        let removed = {
            let mut sockets = self.sockets.write().await;
            let Some(entries) = sockets.get_mut(phone_full) else {
                warn!(user = phone_full, %socket_id, "Disconnect for identity with no sockets");
                return;
            };

            let removed = entries
                .iter()
                .position(|e| e.socket.socket_id == socket_id)
                .map(|idx| entries.remove(idx).socket);
            let session_still_connected = removed
                .as_ref()
                .map(|r| entries.iter().any(|e| e.socket.session_id == r.session_id))
                .unwrap_or(false);
            if entries.is_empty() {
                sockets.remove(phone_full);
            }
            removed.map(|r| (r, session_still_connected))
        };

        let Some((socket, session_still_connected)) = removed else {
            warn!(user = phone_full, %socket_id, "Disconnect for unknown socket");
            return;
        };

        info!(user = phone_full, session = %socket.session_id, %socket_id, "Socket disconnected");

        if session_still_connected {
            return;
        }
        if let Err(e) = self
            .store
            .call(|db| db.set_session_online(phone_full, &socket.session_id, false))
        {
            warn!(user = phone_full, session = %socket.session_id, error = %e, "Failed to mark session offline");
        }
    }

    /// Sockets currently connected for `phone_full`.
    pub async fn sockets_of(&self, phone_full: &str) -> Vec<ConnectedSocket> {
        self.sockets
            .read()
            .await
            .get(phone_full)
            .map(|entries| entries.iter().map(|e| e.socket.clone()).collect())
            .unwrap_or_default()
    }

    /// Send `frame` to every socket of `phone_full`. At most once per socket,
    /// never retried. Returns the number of sockets that accepted the frame.
    pub async fn publish(&self, phone_full: &str, frame: &SocketFrame) -> usize {
        let sockets = self.sockets.read().await;
        let Some(entries) = sockets.get(phone_full) else {
            return 0;
        };

        let mut delivered = 0;
        for entry in entries {
            match entry.tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => debug!(
                    user = phone_full,
                    socket_id = %entry.socket.socket_id,
                    "Dropping frame for slow or closed socket"
                ),
            }
        }
        delivered
    }

    pub async fn connection_count(&self) -> usize {
        self.sockets.read().await.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use courier_shared::types::DeviceKind;
    use courier_store::{User, UserSession};

    use super::*;
    use crate::store::test_store;

    fn seed(store: &Store, phone: &str, sessions: &[&str]) {
        let user = User {
            phone_full: phone.into(),
            phone: phone.into(),
            country_code: "1".into(),
            username: None,
            first_name: String::new(),
            last_name: String::new(),
            avatar: None,
            sessions: sessions
                .iter()
                .map(|s| UserSession::new(*s, DeviceKind::Android))
                .collect(),
            group_threads: Default::default(),
            created_at: 0,
        };
        store.call(|db| db.insert_user(&user)).unwrap();
    }

    fn online(store: &Store, phone: &str, session: &str) -> bool {
        store
            .call(|db| db.get_user(phone))
            .unwrap()
            .session(session)
            .unwrap()
            .online
    }

    #[tokio::test]
    async fn connect_and_disconnect_flip_online() {
        let (_dir, store) = test_store();
        seed(&store, "alice", &["a1"]);
        let registry = SessionRegistry::new(store.clone());
        let (tx, _rx) = mpsc::channel(4);

        let socket_id = registry.connect("alice", "a1", tx).await;
        assert!(online(&store, "alice", "a1"));
        assert_eq!(registry.sockets_of("alice").await.len(), 1);

        registry.disconnect("alice", socket_id).await;
        assert!(!online(&store, "alice", "a1"));
        assert!(registry.sockets_of("alice").await.is_empty());
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn second_socket_keeps_session_online() {
        let (_dir, store) = test_store();
        seed(&store, "alice", &["a1"]);
        let registry = SessionRegistry::new(store.clone());
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);

        let first = registry.connect("alice", "a1", tx1).await;
        registry.connect("alice", "a1", tx2).await;
        registry.disconnect("alice", first).await;

        assert!(online(&store, "alice", "a1"));
    }

    #[tokio::test]
    async fn disconnect_of_unknown_identity_is_benign() {
        let (_dir, store) = test_store();
        let registry = SessionRegistry::new(store);
        registry.disconnect("nobody", Uuid::new_v4()).await;
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn publish_reaches_every_socket_of_identity() {
        let (_dir, store) = test_store();
        seed(&store, "bob", &["b1", "b2"]);
        let registry = SessionRegistry::new(store);
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        registry.connect("bob", "b1", tx1).await;
        registry.connect("bob", "b2", tx2).await;

        let frame = SocketFrame::new("chat-message", "abc");
        assert_eq!(registry.publish("bob", &frame).await, 2);
        assert_eq!(registry.publish("carol", &frame).await, 0);

        assert_eq!(rx1.recv().await.unwrap(), frame);
        assert_eq!(rx2.recv().await.unwrap(), frame);
    }
}
