//! Topic rooms: subscribe/unsubscribe and fan-out routing.
//!
//! A room is a named fan-out group of connections. Rooms are created
//! lazily on first join and garbage-collected at zero membership; the
//! global fleet room is never collected. Membership tables are DashMap
//! sharded, so unrelated rooms never contend on a common lock.
//!
//! Delivery is at-least-once for members connected at publish time:
//! a member whose outbound buffer is full or closed is disconnected
//! rather than allowed to stall the publish for everyone else.

use crate::error::{Result, TrackerError};
use crate::protocol::ServerMessage;
use crate::registry::{Connection, ConnectionId, ConnectionRegistry};
use axum::extract::ws::Message;
use dashmap::{DashMap, DashSet};
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The global room every vehicle update is mirrored into.
pub const GLOBAL_ROOM: &str = "fleet:all";

/// Room identifier for a single vehicle's updates.
pub fn vehicle_room(vehicle_id: &str) -> String {
    format!("vehicle:{}", vehicle_id)
}

/// Room identifier for all vehicles on one route.
pub fn route_room(route_id: &str) -> String {
    format!("route:{}", route_id)
}

/// Classified room identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomKind {
    Vehicle(String),
    Route(String),
    Global,
}

impl RoomKind {
    /// Parse a room identifier. Returns None for names outside the
    /// vehicle/route/global scheme.
    pub fn parse(room_id: &str) -> Option<Self> {
        if room_id == GLOBAL_ROOM {
            return Some(Self::Global);
        }
        if let Some(id) = room_id.strip_prefix("vehicle:") {
            if !id.is_empty() {
                return Some(Self::Vehicle(id.to_string()));
            }
        }
        if let Some(id) = room_id.strip_prefix("route:") {
            if !id.is_empty() {
                return Some(Self::Route(id.to_string()));
            }
        }
        None
    }
}

/// Topic-based fan-out broker over the connection registry.
pub struct RoomBroker {
    registry: Arc<ConnectionRegistry>,
    /// Room ID → member connection IDs.
    rooms: DashMap<String, DashSet<ConnectionId>>,
}

impl RoomBroker {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            rooms: DashMap::new(),
        }
    }

    /// Add a connection to a room, creating the room if absent.
    /// Idempotent; re-joining an already joined room is a no-op.
    pub fn join(&self, conn_id: &ConnectionId, room_id: &str) -> Result<()> {
        let conn = self
            .registry
            .get(conn_id)
            .ok_or_else(|| TrackerError::NotFound(conn_id.to_string()))?;

        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(*conn_id);
        conn.rooms.insert(room_id.to_string());

        debug!("Connection {} joined room {}", conn_id, room_id);
        Ok(())
    }

    /// Remove a connection from a room. Idempotent; empty non-global
    /// rooms are garbage-collected.
    pub fn leave(&self, conn_id: &ConnectionId, room_id: &str) -> Result<()> {
        if let Some(conn) = self.registry.get(conn_id) {
            conn.rooms.remove(room_id);
        }
        if let Some(members) = self.rooms.get(room_id) {
            members.remove(conn_id);
        }
        self.collect_if_empty(room_id);

        debug!("Connection {} left room {}", conn_id, room_id);
        Ok(())
    }

    /// Deliver a message to every current member of a room.
    ///
    /// The payload is serialized once. Members who disconnect mid-publish
    /// are skipped; members whose buffer is full are disconnected. The
    /// publish itself never fails and returns the delivered count.
    pub fn publish(&self, room_id: &str, msg: &ServerMessage) -> usize {
        let member_ids: Vec<ConnectionId> = match self.rooms.get(room_id) {
            Some(members) => members.iter().map(|id| *id).collect(),
            None => return 0,
        };
        if member_ids.is_empty() {
            return 0;
        }

        let json = match serde_json::to_string(msg) {
            Ok(j) => j,
            Err(e) => {
                warn!("Failed to serialize message for room {}: {}", room_id, e);
                return 0;
            }
        };

        let mut delivered = 0;
        let mut dropped: Vec<ConnectionId> = Vec::new();

        for id in member_ids {
            // Skipped silently: the member disconnected mid-publish.
            let Some(conn) = self.registry.get(&id) else {
                continue;
            };
            if conn.try_send_raw(Message::Text(json.clone().into())) {
                delivered += 1;
            } else {
                dropped.push(id);
            }
        }

        for id in dropped {
            warn!(
                "Dropping connection {} from room {}: outbound buffer full or closed",
                id, room_id
            );
            counter!("tracker_delivery_drops_total").increment(1);
            self.disconnect(&id);
        }

        counter!("tracker_messages_published_total").increment(1);
        delivered
    }

    /// Remove a connection from every room it belongs to and from the
    /// registry. Safe to call for already-gone connections.
    pub fn disconnect(&self, conn_id: &ConnectionId) {
        let Some(conn) = self.registry.unregister(conn_id) else {
            return;
        };
        self.purge(&conn);
        info!("Connection {} disconnected", conn_id);
    }

    /// Remove a connection from every room membership table.
    fn purge(&self, conn: &Connection) {
        for room_id in conn.rooms.iter().map(|r| r.clone()).collect::<Vec<_>>() {
            if let Some(members) = self.rooms.get(&room_id) {
                members.remove(&conn.id);
            }
            self.collect_if_empty(&room_id);
            conn.rooms.remove(&room_id);
        }
    }

    fn collect_if_empty(&self, room_id: &str) {
        if room_id == GLOBAL_ROOM {
            return;
        }
        self.rooms.remove_if(room_id, |_, members| members.is_empty());
    }

    /// Current member connection IDs of a room.
    pub fn members(&self, room_id: &str) -> Vec<ConnectionId> {
        match self.rooms.get(room_id) {
            Some(members) => members.iter().map(|id| *id).collect(),
            None => Vec::new(),
        }
    }

    pub fn member_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map(|m| m.len()).unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<ConnectionRegistry>, RoomBroker) {
        let registry = Arc::new(ConnectionRegistry::new());
        let broker = RoomBroker::new(Arc::clone(&registry));
        (registry, broker)
    }

    fn connect(
        registry: &ConnectionRegistry,
        actor: &str,
        buffer: usize,
    ) -> (ConnectionId, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(buffer);
        let conn = Arc::new(Connection::new(actor, Role::Subscriber, tx));
        let id = registry.register(conn).unwrap();
        (id, rx)
    }

    #[test]
    fn test_room_kind_parse() {
        assert_eq!(
            RoomKind::parse("vehicle:bus-12"),
            Some(RoomKind::Vehicle("bus-12".to_string()))
        );
        assert_eq!(
            RoomKind::parse("route:r4"),
            Some(RoomKind::Route("r4".to_string()))
        );
        assert_eq!(RoomKind::parse("fleet:all"), Some(RoomKind::Global));
        assert_eq!(RoomKind::parse("vehicle:"), None);
        assert_eq!(RoomKind::parse("lounge"), None);
    }

    #[tokio::test]
    async fn test_join_leave_idempotent() {
        let (registry, broker) = setup();
        let (id, _rx) = connect(&registry, "rider-1", 8);

        broker.join(&id, "vehicle:v1").unwrap();
        broker.join(&id, "vehicle:v1").unwrap();
        assert_eq!(broker.member_count("vehicle:v1"), 1);

        broker.leave(&id, "vehicle:v1").unwrap();
        broker.leave(&id, "vehicle:v1").unwrap();
        assert_eq!(broker.member_count("vehicle:v1"), 0);
        // empty non-global room is collected
        assert_eq!(broker.room_count(), 0);
    }

    #[tokio::test]
    async fn test_global_room_not_collected() {
        let (registry, broker) = setup();
        let (id, _rx) = connect(&registry, "rider-1", 8);

        broker.join(&id, GLOBAL_ROOM).unwrap();
        broker.leave(&id, GLOBAL_ROOM).unwrap();
        assert_eq!(broker.room_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_reaches_all_members_in_order() {
        let (registry, broker) = setup();
        let (a, mut rx_a) = connect(&registry, "rider-a", 8);
        let (b, mut rx_b) = connect(&registry, "rider-b", 8);
        broker.join(&a, "vehicle:v1").unwrap();
        broker.join(&b, "vehicle:v1").unwrap();

        let first = ServerMessage::RoomJoined {
            room: "vehicle:v1".to_string(),
        };
        let second = ServerMessage::Pong;
        assert_eq!(broker.publish("vehicle:v1", &first), 2);
        assert_eq!(broker.publish("vehicle:v1", &second), 2);

        for rx in [&mut rx_a, &mut rx_b] {
            let m1 = rx.try_recv().unwrap();
            let m2 = rx.try_recv().unwrap();
            match (m1, m2) {
                (Message::Text(t1), Message::Text(t2)) => {
                    assert!(t1.contains("room_joined"));
                    assert!(t2.contains("pong"));
                }
                other => panic!("unexpected frames: {:?}", other),
            }
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_publish_skips_disconnected_member() {
        let (registry, broker) = setup();
        let (a, mut rx_a) = connect(&registry, "rider-a", 8);
        let (b, _rx_b) = connect(&registry, "rider-b", 8);
        broker.join(&a, "vehicle:v1").unwrap();
        broker.join(&b, "vehicle:v1").unwrap();

        broker.disconnect(&b);

        let delivered = broker.publish("vehicle:v1", &ServerMessage::Pong);
        assert_eq!(delivered, 1);
        assert!(rx_a.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_slow_member_is_dropped() {
        let (registry, broker) = setup();
        // Buffer of one: the second publish overflows.
        let (slow, _rx_slow) = connect(&registry, "rider-slow", 1);
        let (ok, mut rx_ok) = connect(&registry, "rider-ok", 8);
        broker.join(&slow, "vehicle:v1").unwrap();
        broker.join(&ok, "vehicle:v1").unwrap();

        broker.publish("vehicle:v1", &ServerMessage::Pong);
        broker.publish("vehicle:v1", &ServerMessage::Pong);

        // Slow member was disconnected entirely; healthy member got both.
        assert!(registry.get(&slow).is_none());
        assert_eq!(broker.member_count("vehicle:v1"), 1);
        assert!(rx_ok.try_recv().is_ok());
        assert!(rx_ok.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_purges_all_rooms() {
        let (registry, broker) = setup();
        let (id, _rx) = connect(&registry, "rider-1", 8);
        broker.join(&id, "vehicle:v1").unwrap();
        broker.join(&id, "route:r1").unwrap();
        broker.join(&id, GLOBAL_ROOM).unwrap();

        broker.disconnect(&id);

        assert_eq!(broker.member_count("vehicle:v1"), 0);
        assert_eq!(broker.member_count("route:r1"), 0);
        assert_eq!(broker.member_count(GLOBAL_ROOM), 0);
        assert!(registry.get(&id).is_none());
    }
}
