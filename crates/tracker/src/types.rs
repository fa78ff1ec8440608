//! Core domain types for vehicle tracking.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Current timestamp in milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Role of an authenticated actor, as presented by the identity layer
/// at connection time. The engine performs no credential verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Vehicle operator; may submit vehicle position reports.
    Driver,
    /// Rider; may opt in to location sharing and receive alerts.
    Subscriber,
    /// Fleet staff; may submit reports for any vehicle.
    Staff,
}

/// Geographic position in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
}

impl Position {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// A position is usable only when both coordinates are finite numbers.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite() && self.lon.is_finite()
    }
}

/// Operational status of a vehicle, sourced from the fleet collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleStatus {
    Operational,
    Idle,
    Maintenance,
    Breakdown,
}

impl VehicleStatus {
    /// Whether proximity evaluation runs for a vehicle in this status.
    pub fn is_tracking(&self) -> bool {
        matches!(self, Self::Operational | Self::Idle)
    }
}

/// A single inbound position report from a vehicle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationReport {
    pub position: Position,
    /// Compass heading in degrees, 0-359. Absent when the device has no fix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<u16>,
    /// Ground speed in meters per second.
    pub speed: f64,
    /// Reported GPS accuracy in meters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// Device timestamp in milliseconds.
    pub timestamp_ms: i64,
}

/// Last-known kinematic state of one vehicle.
///
/// Superseded on every applied report, never deleted. Only the
/// location ingestor writes this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleState {
    pub vehicle_id: String,
    pub position: Position,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<u16>,
    pub speed: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// Route the vehicle is currently assigned to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    pub status: VehicleStatus,
    /// Timestamp of the applied report, milliseconds.
    pub updated_at: i64,
}

/// Last-known position of a subscriber who enabled location sharing.
///
/// Created on opt-in, destroyed on opt-out. Position is cleared the
/// moment sharing is disabled.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberState {
    pub actor_id: String,
    pub position: Option<Position>,
    pub updated_at: i64,
    pub sharing_enabled: bool,
}

/// A fixed geospatial point of interest (e.g. a stop) used as a
/// proximity target. Read-only from the engine's perspective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waypoint {
    pub waypoint_id: String,
    pub position: Position,
    pub name: String,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_validity() {
        assert!(Position::new(9.03, 38.74).is_valid());
        assert!(!Position::new(f64::NAN, 38.74).is_valid());
        assert!(!Position::new(9.03, f64::INFINITY).is_valid());
    }

    #[test]
    fn test_status_tracking() {
        assert!(VehicleStatus::Operational.is_tracking());
        assert!(VehicleStatus::Idle.is_tracking());
        assert!(!VehicleStatus::Maintenance.is_tracking());
        assert!(!VehicleStatus::Breakdown.is_tracking());
    }

    #[test]
    fn test_role_serde() {
        let json = serde_json::to_string(&Role::Subscriber).unwrap();
        assert_eq!(json, r#""subscriber""#);
        let role: Role = serde_json::from_str(r#""driver""#).unwrap();
        assert_eq!(role, Role::Driver);
    }
}
