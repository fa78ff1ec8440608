//! Real-time vehicle location broadcast and proximity alerting engine.
//!
//! This crate is the live signal-routing core of a transit-tracking
//! platform:
//! - Accepts position reports from moving vehicles
//! - Fans updates out to live connections grouped into topic rooms
//! - Evaluates vehicle-to-waypoint and vehicle-to-subscriber proximity
//!   with edge-triggered, one-shot alerting
//! - Gates all subscriber position data behind explicit opt-in
//!
//! ## Architecture
//!
//! ```text
//! WebSocket connections (gateway crate)
//!         ↓ reports
//! LocationIngestor (per-vehicle serialization, coalescing)
//!         ↓ applied updates
//! Engine pump ──→ RoomBroker ──→ connection channels
//!         ↓
//! ProximityEngine (haversine, edge-triggered watches)
//!         ↓ alerts
//! NotificationEmitter ──→ connections + durable history
//! ```
//!
//! ## Low-Latency Design
//!
//! - Lock-free DashMap tables for connections, rooms, and watches
//! - Per-vehicle async mutex slots; distinct vehicles never contend
//! - Pre-serialized broadcast payloads, one serialization per publish
//! - Bounded outbound buffers; a slow consumer is disconnected rather
//!   than allowed to stall the publish path

pub mod engine;
pub mod error;
pub mod fleet;
pub mod geo;
pub mod ingest;
pub mod notify;
pub mod privacy;
pub mod protocol;
pub mod proximity;
pub mod registry;
pub mod rooms;
pub mod types;

pub use engine::{Engine, EngineConfig};
pub use error::{Result, TrackerError};
pub use fleet::{FleetDirectory, StaticFleet};
pub use ingest::{IngestOutcome, LocationIngestor};
pub use notify::{
    InMemoryNotificationStore, NotificationEmitter, NotificationRecord, NotificationStore,
    RedisNotificationStore,
};
pub use privacy::PrivacyGate;
pub use protocol::{AlertKind, AlertPayload, ClientMessage, ServerMessage};
pub use proximity::{ProximityEngine, ProximityEvent, WatchTarget, DEFAULT_THRESHOLD_M};
pub use registry::{Connection, ConnectionId, ConnectionRegistry, OUTBOUND_BUFFER_SIZE};
pub use rooms::{route_room, vehicle_room, RoomBroker, RoomKind, GLOBAL_ROOM};
pub use types::{
    LocationReport, Position, Role, SubscriberState, VehicleState, VehicleStatus, Waypoint,
};
