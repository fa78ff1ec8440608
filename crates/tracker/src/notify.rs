//! Alert formatting, delivery, and durable notification history.
//!
//! Delivery and persistence are attempted independently: a failure in
//! one never blocks the other, and both are non-fatal for the engine.
//! Persistence runs on a spawned task so the broadcast path never
//! waits on the store.

use crate::error::Result;
use crate::protocol::{AlertKind, AlertPayload, ServerMessage};
use crate::proximity::{ProximityEvent, WatchTarget};
use crate::registry::ConnectionRegistry;
use crate::rooms::{vehicle_room, RoomBroker};
use async_trait::async_trait;
use metrics::counter;
use redis::AsyncCommands;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Append-only notification record handed to the persistence
/// collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationRecord {
    /// Actor (or vehicle, for waypoint alerts) the notification is about.
    pub subject_actor_id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

/// Durable notification history collaborator.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn append(&self, record: NotificationRecord) -> Result<()>;
}

/// Builds and dispatches proximity alerts.
pub struct NotificationEmitter {
    broker: Arc<RoomBroker>,
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn NotificationStore>,
}

impl NotificationEmitter {
    pub fn new(
        broker: Arc<RoomBroker>,
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn NotificationStore>,
    ) -> Self {
        Self {
            broker,
            registry,
            store,
        }
    }

    /// Dispatch one proximity event: deliver to the interested live
    /// connections and persist the record. Each leg is independent.
    pub fn emit(&self, event: &ProximityEvent) {
        let payload = build_payload(event);
        let msg = ServerMessage::ProximityAlert(payload.clone());

        let subject = match &event.target {
            // Waypoint arrivals go to everyone watching the vehicle.
            WatchTarget::Waypoint(_) => {
                let delivered = self.broker.publish(&vehicle_room(&event.vehicle_id), &msg);
                debug!(
                    "Waypoint alert for {} delivered to {} connections",
                    event.vehicle_id, delivered
                );
                event.vehicle_id.clone()
            }
            // Subscriber alerts go only to that subscriber's connections.
            WatchTarget::Subscriber(actor_id) => {
                for conn in self.registry.connections_for_actor(actor_id) {
                    if let Err(e) = conn.send(&msg) {
                        warn!("Alert delivery to {} failed: {}", conn.id, e);
                    }
                }
                actor_id.clone()
            }
        };

        counter!("tracker_alerts_dispatched_total").increment(1);
        self.persist(subject, &payload);
    }

    /// Hand the record to the store without blocking the caller.
    /// Persistence failures are logged and otherwise ignored.
    fn persist(&self, subject_actor_id: String, payload: &AlertPayload) {
        let record = match serde_json::to_value(payload) {
            Ok(value) => NotificationRecord {
                subject_actor_id,
                kind: kind_str(payload.kind).to_string(),
                payload: value,
                created_at: payload.timestamp_ms,
            },
            Err(e) => {
                warn!("Failed to serialize notification payload: {}", e);
                return;
            }
        };
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.append(record).await {
                warn!("Failed to persist notification: {}", e);
            } else {
                counter!("tracker_notifications_persisted_total").increment(1);
            }
        });
    }
}

fn kind_str(kind: AlertKind) -> &'static str {
    match kind {
        AlertKind::WaypointProximity => "waypoint_proximity",
        AlertKind::SubscriberProximity => "subscriber_proximity",
    }
}

/// Build the delivery payload for a proximity event. ETA is derived
/// from current speed when the vehicle is actually moving.
pub fn build_payload(event: &ProximityEvent) -> AlertPayload {
    let (kind, target_id) = match &event.target {
        WatchTarget::Waypoint(id) => (AlertKind::WaypointProximity, id.clone()),
        WatchTarget::Subscriber(id) => (AlertKind::SubscriberProximity, id.clone()),
    };
    let eta_seconds = if event.speed_mps > 0.0 {
        Some(event.distance_m / event.speed_mps)
    } else {
        None
    };
    AlertPayload {
        kind,
        vehicle_id: event.vehicle_id.clone(),
        target_id,
        target_name: event.target_name.clone(),
        distance_m: event.distance_m,
        eta_seconds,
        timestamp_ms: event.timestamp_ms,
    }
}

// ============================================================================
// Store implementations
// ============================================================================

/// In-memory store used by tests and single-node setups without Redis.
#[derive(Default)]
pub struct InMemoryNotificationStore {
    records: std::sync::Mutex<Vec<NotificationRecord>>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<NotificationRecord> {
        self.records.lock().expect("store lock poisoned").clone()
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn append(&self, record: NotificationRecord) -> Result<()> {
        self.records
            .lock()
            .expect("store lock poisoned")
            .push(record);
        Ok(())
    }
}

/// Redis key prefix for notification history: notifications:{subject}
const NOTIFICATION_KEY_PREFIX: &str = "notifications:";

/// Redis-backed notification history, appended per subject.
pub struct RedisNotificationStore {
    client: redis::Client,
}

impl RedisNotificationStore {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NotificationStore for RedisNotificationStore {
    async fn append(&self, record: NotificationRecord) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("{}{}", NOTIFICATION_KEY_PREFIX, record.subject_actor_id);
        let json = serde_json::to_string(&record)?;
        conn.rpush::<_, _, ()>(&key, &json).await?;
        debug!("Persisted notification for {}", record.subject_actor_id);
        Ok(())
    }
}
