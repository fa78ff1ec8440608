//! Wire protocol message types.
//!
//! Defines the JSON message format between the gateway and live
//! connections. Both directions are closed tagged enums so a new
//! message kind is a compile-checked exhaustive match, not a string
//! dispatch.

use crate::types::{LocationReport, Position, VehicleState};
use serde::{Deserialize, Serialize};

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Message sent from a connected client to the gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a fan-out room (e.g. "vehicle:bus-12", "route:r4", "fleet:all").
    JoinRoom {
        room: String,
    },
    /// Leave a previously joined room.
    LeaveRoom {
        room: String,
    },
    /// Vehicle position report. Drivers and staff only.
    VehicleLocation {
        vehicle_id: String,
        report: LocationReport,
    },
    /// Subscriber position update. Rejected unless sharing is enabled.
    SubscriberLocation {
        position: Position,
    },
    /// Enable or disable location sharing for this subscriber.
    ToggleSharing {
        enabled: bool,
    },
    /// Keepalive ping.
    Ping,
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Message sent from the gateway to a connected client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Single-vehicle location broadcast.
    VehicleUpdate(VehicleState),
    /// Snapshot of current vehicle states, sent on room join.
    FleetSnapshot {
        vehicles: Vec<VehicleState>,
    },
    /// Edge-triggered proximity alert.
    ProximityAlert(AlertPayload),
    /// Acknowledgment of a room join.
    RoomJoined {
        room: String,
    },
    /// Acknowledgment of a room leave.
    RoomLeft {
        room: String,
    },
    /// Acknowledgment of a sharing toggle.
    SharingToggled {
        enabled: bool,
    },
    /// Pong response to ping.
    Pong,
    /// Error ack for an invalid inbound message.
    Error {
        message: String,
        code: String,
    },
}

/// Kind of proximity alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Vehicle approaching a fixed waypoint.
    WaypointProximity,
    /// Vehicle approaching an opted-in subscriber.
    SubscriberProximity,
}

/// Delivery payload of a proximity alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertPayload {
    pub kind: AlertKind,
    pub vehicle_id: String,
    /// Waypoint identifier or subscriber actor identifier.
    pub target_id: String,
    /// Display name of the target, when it has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
    /// Distance at the triggering evaluation, meters.
    pub distance_m: f64,
    /// Estimated seconds to target at current speed, when derivable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
    pub timestamp_ms: i64,
}
