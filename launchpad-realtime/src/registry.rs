use chrono::{DateTime, Utc};
use launchpad_common::is_valid_channel;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// One live client connection, owned exclusively by the registry of the
/// instance that accepted it. The transport itself lives in the writer
/// pump; the registry only ever touches the outbound channel.
#[derive(Debug)]
struct ClientConnection {
    sender: mpsc::UnboundedSender<Message>,
    identity: Option<String>,
    rooms: HashSet<String>,
    last_activity: Instant,
    #[allow(dead_code)]
    connected_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, ClientConnection>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

/// Connection and room membership maps. Both sides of the bidirectional
/// index mutate under the same lock, so they cannot drift apart; network
/// writes always happen after the lock is released.
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    pub async fn register(
        &self,
        sender: mpsc::UnboundedSender<Message>,
        identity: Option<String>,
    ) -> ConnectionId {
        let id = Uuid::new_v4();
        let mut inner = self.inner.write().await;
        inner.connections.insert(
            id,
            ClientConnection {
                sender,
                identity,
                rooms: HashSet::new(),
                last_activity: Instant::now(),
                connected_at: Utc::now(),
            },
        );
        id
    }

    /// Remove the connection and cascade it out of every room it joined.
    pub async fn deregister(&self, id: ConnectionId) -> bool {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.remove(&id) else {
            return false;
        };
        for room in &conn.rooms {
            if let Some(members) = inner.rooms.get_mut(room) {
                members.remove(&id);
                if members.is_empty() {
                    inner.rooms.remove(room);
                }
            }
        }
        true
    }

    /// Idempotent join. Unknown channel names are rejected silently so the
    /// wire surface leaks nothing about valid room names.
    pub async fn join_room(&self, id: ConnectionId, room: &str) -> bool {
        if !is_valid_channel(room) {
            debug!(connection = %id, room, "Rejecting unrecognized channel");
            return false;
        }
        let mut inner = self.inner.write().await;
        if !inner.connections.contains_key(&id) {
            return false;
        }
        inner
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(id);
        if let Some(conn) = inner.connections.get_mut(&id) {
            conn.rooms.insert(room.to_string());
        }
        true
    }

    /// Safe when the connection never joined: leaving is a no-op then.
    pub async fn leave_room(&self, id: ConnectionId, room: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get_mut(&id) else {
            return false;
        };
        let was_member = conn.rooms.remove(room);
        if let Some(members) = inner.rooms.get_mut(room) {
            members.remove(&id);
            if members.is_empty() {
                inner.rooms.remove(room);
            }
        }
        was_member
    }

    pub async fn touch(&self, id: ConnectionId) {
        let mut inner = self.inner.write().await;
        if let Some(conn) = inner.connections.get_mut(&id) {
            conn.last_activity = Instant::now();
        }
    }

    /// Write `payload` to every open member of `room`. Membership lookup
    /// and sender cloning happen under the lock; the sends do not. A closed
    /// outbound channel is a delivery no-op, not an error; the heartbeat
    /// sweep reaps the connection behind it.
    pub async fn deliver(
        &self,
        room: &str,
        payload: &Value,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let senders: Vec<(ConnectionId, mpsc::UnboundedSender<Message>)> = {
            let inner = self.inner.read().await;
            let Some(members) = inner.rooms.get(room) else {
                return 0;
            };
            members
                .iter()
                .filter(|id| Some(**id) != exclude)
                .filter_map(|id| {
                    inner
                        .connections
                        .get(id)
                        .map(|conn| (*id, conn.sender.clone()))
                })
                .collect()
        };

        let message = Message::Text(payload.to_string().into());
        let mut delivered = 0;
        for (id, sender) in senders {
            if sender.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!(connection = %id, "Skipping delivery to closed transport");
            }
        }
        delivered
    }

    pub async fn deliver_all(&self, payload: &Value, exclude: Option<ConnectionId>) -> usize {
        let senders: Vec<mpsc::UnboundedSender<Message>> = {
            let inner = self.inner.read().await;
            inner
                .connections
                .iter()
                .filter(|(id, _)| Some(**id) != exclude)
                .map(|(_, conn)| conn.sender.clone())
                .collect()
        };

        let message = Message::Text(payload.to_string().into());
        senders
            .into_iter()
            .filter(|sender| sender.send(message.clone()).is_ok())
            .count()
    }

    /// Connections with no observed activity for longer than `timeout`.
    pub async fn stale_connections(&self, timeout: Duration) -> Vec<ConnectionId> {
        let inner = self.inner.read().await;
        inner
            .connections
            .iter()
            .filter(|(_, conn)| conn.last_activity.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Send a Ping frame to every connection; stale sends are no-ops.
    pub async fn ping_all(&self) -> usize {
        let senders: Vec<mpsc::UnboundedSender<Message>> = {
            let inner = self.inner.read().await;
            inner
                .connections
                .values()
                .map(|conn| conn.sender.clone())
                .collect()
        };
        senders
            .into_iter()
            .filter(|sender| sender.send(Message::Ping(vec![].into())).is_ok())
            .count()
    }

    /// Force-close: a best-effort Close frame, then full deregistration.
    pub async fn close_connection(&self, id: ConnectionId) -> bool {
        {
            let inner = self.inner.read().await;
            if let Some(conn) = inner.connections.get(&id) {
                let _ = conn.sender.send(Message::Close(None));
            }
        }
        self.deregister(id).await
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }

    pub async fn room_members(&self, room: &str) -> HashSet<ConnectionId> {
        self.inner
            .read()
            .await
            .rooms
            .get(room)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn rooms_of(&self, id: ConnectionId) -> HashSet<String> {
        self.inner
            .read()
            .await
            .connections
            .get(&id)
            .map(|conn| conn.rooms.clone())
            .unwrap_or_default()
    }

    pub async fn identity_of(&self, id: ConnectionId) -> Option<String> {
        self.inner
            .read()
            .await
            .connections
            .get(&id)
            .and_then(|conn| conn.identity.clone())
    }

    #[cfg(test)]
    pub async fn backdate_activity(&self, id: ConnectionId, age: Duration) {
        let mut inner = self.inner.write().await;
        if let Some(conn) = inner.connections.get_mut(&id) {
            conn.last_activity = Instant::now() - age;
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
