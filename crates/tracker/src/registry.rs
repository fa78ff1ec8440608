//! Connection state and registry management.
//!
//! Uses lock-free DashMap for high-throughput concurrent access. A
//! secondary actor index lets the notification path address every live
//! connection belonging to one actor.

use crate::error::{Result, TrackerError};
use crate::protocol::ServerMessage;
use crate::types::{now_ms, Role};
use axum::extract::ws::Message;
use dashmap::{DashMap, DashSet};
use metrics::gauge;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Unique connection identifier.
pub type ConnectionId = Uuid;

/// Outbound buffer per connection. Sized for a burst of full-fleet
/// broadcasts; a client that cannot drain this is disconnected.
pub const OUTBOUND_BUFFER_SIZE: usize = 256;

/// One live, bidirectional channel to a single authenticated actor.
pub struct Connection {
    /// Unique connection identifier.
    pub id: ConnectionId,
    /// Authenticated actor identifier from the identity layer.
    pub actor_id: String,
    /// Actor role presented at connection establishment.
    pub role: Role,
    /// Rooms this connection currently belongs to. Mutated only by the
    /// room broker on join/leave.
    pub rooms: DashSet<String>,
    /// Channel to the connection's WebSocket write task. Bounded so a
    /// slow client cannot hold broadcast memory hostage.
    pub tx: mpsc::Sender<Message>,
    /// Timestamp when the connection was established.
    pub connected_at: i64,
    /// Timestamp of last inbound activity.
    last_activity: AtomicI64,
}

impl Connection {
    pub fn new(actor_id: impl Into<String>, role: Role, tx: mpsc::Sender<Message>) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4(),
            actor_id: actor_id.into(),
            role,
            rooms: DashSet::new(),
            tx,
            connected_at: now,
            last_activity: AtomicI64::new(now),
        }
    }

    /// Serialize and send a message to this connection.
    /// Non-blocking; fails when the outbound buffer is full or closed.
    pub fn send(&self, msg: &ServerMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        self.tx
            .try_send(Message::Text(json.into()))
            .map_err(|_| TrackerError::DeliveryFailure(self.id.to_string()))
    }

    /// Try to send a raw frame. Returns false when the buffer is full
    /// or the connection is gone.
    pub fn try_send_raw(&self, msg: Message) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Record inbound activity for liveness tracking.
    pub fn touch(&self) {
        self.last_activity.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }
}

/// Lock-free registry of live connections.
///
/// Maintains:
/// - Connection ID → Connection
/// - Actor ID → Connection IDs (one actor may hold several connections)
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    by_actor: DashMap<String, DashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            by_actor: DashMap::new(),
        }
    }

    /// Register a new connection. Fails when the identifier is already
    /// registered.
    pub fn register(&self, conn: Arc<Connection>) -> Result<ConnectionId> {
        let id = conn.id;
        if self.connections.contains_key(&id) {
            return Err(TrackerError::DuplicateConnection(id.to_string()));
        }
        self.by_actor
            .entry(conn.actor_id.clone())
            .or_default()
            .insert(id);
        self.connections.insert(id, conn);
        gauge!("tracker_active_connections").set(self.connections.len() as f64);
        info!("Connection {} registered", id);
        Ok(id)
    }

    /// Remove a connection. Idempotent on unknown identifiers.
    ///
    /// Returns the removed connection so the caller (the room broker)
    /// can purge its room memberships.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let (_, conn) = self.connections.remove(id)?;
        if let Some(ids) = self.by_actor.get(&conn.actor_id) {
            ids.remove(id);
        }
        self.by_actor
            .remove_if(&conn.actor_id, |_, ids| ids.is_empty());
        gauge!("tracker_active_connections").set(self.connections.len() as f64);
        info!("Connection {} unregistered", id);
        Some(conn)
    }

    /// Get a connection by ID.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| Arc::clone(&c))
    }

    /// Update last-activity for liveness. No-op on unknown identifiers.
    pub fn touch(&self, id: &ConnectionId) {
        if let Some(conn) = self.connections.get(id) {
            conn.touch();
        }
    }

    /// Current room memberships of a connection.
    pub fn lookup(&self, id: &ConnectionId) -> Result<Vec<String>> {
        let conn = self
            .connections
            .get(id)
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))?;
        Ok(conn.rooms.iter().map(|r| r.clone()).collect())
    }

    /// All live connections belonging to one actor.
    pub fn connections_for_actor(&self, actor_id: &str) -> Vec<Arc<Connection>> {
        match self.by_actor.get(actor_id) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.get(&id))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Connections with no inbound activity for longer than `max_idle_ms`.
    pub fn stale_ids(&self, max_idle_ms: i64) -> Vec<ConnectionId> {
        let cutoff = now_ms() - max_idle_ms;
        self.connections
            .iter()
            .filter(|e| e.value().last_activity_ms() < cutoff)
            .map(|e| {
                debug!("Connection {} is stale", e.key());
                *e.key()
            })
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_conn(actor: &str, role: Role) -> Arc<Connection> {
        let (tx, _rx) = mpsc::channel(8);
        Arc::new(Connection::new(actor, role, tx))
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let conn = make_conn("rider-1", Role::Subscriber);
        let id = registry.register(conn).unwrap();

        assert_eq!(registry.connection_count(), 1);
        assert!(registry.lookup(&id).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = ConnectionRegistry::new();
        let conn = make_conn("rider-1", Role::Subscriber);
        registry.register(Arc::clone(&conn)).unwrap();

        let err = registry.register(conn).unwrap_err();
        assert!(matches!(err, TrackerError::DuplicateConnection(_)));
    }

    #[test]
    fn test_unregister_idempotent() {
        let registry = ConnectionRegistry::new();
        let conn = make_conn("rider-1", Role::Subscriber);
        let id = registry.register(conn).unwrap();

        assert!(registry.unregister(&id).is_some());
        assert!(registry.unregister(&id).is_none());
        assert!(matches!(
            registry.lookup(&id),
            Err(TrackerError::NotFound(_))
        ));
    }

    #[test]
    fn test_actor_index() {
        let registry = ConnectionRegistry::new();
        let a = make_conn("rider-1", Role::Subscriber);
        let b = make_conn("rider-1", Role::Subscriber);
        let id_a = registry.register(a).unwrap();
        registry.register(b).unwrap();

        assert_eq!(registry.connections_for_actor("rider-1").len(), 2);

        registry.unregister(&id_a);
        assert_eq!(registry.connections_for_actor("rider-1").len(), 1);
        assert!(registry.connections_for_actor("rider-2").is_empty());
    }
}
