//! Fleet/route collaborator interface.
//!
//! The engine never owns route or waypoint data; it reads them through
//! this trait. Implementations are expected to answer from local state
//! so the hot evaluation path never blocks on a network call.

use crate::types::Waypoint;
use dashmap::DashMap;
use serde::Deserialize;

/// Read-only lookup of vehicle route assignments and route waypoints.
pub trait FleetDirectory: Send + Sync {
    /// Route currently assigned to a vehicle, if any.
    fn assigned_route(&self, vehicle_id: &str) -> Option<String>;

    /// Active waypoints on a route. Deactivated waypoints are excluded.
    fn active_waypoints(&self, route_id: &str) -> Vec<Waypoint>;
}

/// In-memory fleet directory, loaded at startup or built by tests.
#[derive(Default)]
pub struct StaticFleet {
    /// vehicle_id → route_id
    assignments: DashMap<String, String>,
    /// route_id → waypoints
    waypoints: DashMap<String, Vec<Waypoint>>,
}

/// One route entry of a fleet seed file.
#[derive(Debug, Deserialize)]
pub struct RouteSeed {
    pub route_id: String,
    #[serde(default)]
    pub vehicles: Vec<String>,
    #[serde(default)]
    pub waypoints: Vec<Waypoint>,
}

impl StaticFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a directory from a JSON array of [`RouteSeed`] entries.
    pub fn from_json(raw: &str) -> crate::error::Result<Self> {
        let seeds: Vec<RouteSeed> = serde_json::from_str(raw)?;
        let fleet = Self::new();
        for seed in seeds {
            for vehicle in &seed.vehicles {
                fleet.assign_vehicle(vehicle, &seed.route_id);
            }
            fleet.set_waypoints(&seed.route_id, seed.waypoints);
        }
        Ok(fleet)
    }

    pub fn assign_vehicle(&self, vehicle_id: &str, route_id: &str) {
        self.assignments
            .insert(vehicle_id.to_string(), route_id.to_string());
    }

    pub fn unassign_vehicle(&self, vehicle_id: &str) {
        self.assignments.remove(vehicle_id);
    }

    pub fn set_waypoints(&self, route_id: &str, waypoints: Vec<Waypoint>) {
        self.waypoints.insert(route_id.to_string(), waypoints);
    }
}

impl FleetDirectory for StaticFleet {
    fn assigned_route(&self, vehicle_id: &str) -> Option<String> {
        self.assignments.get(vehicle_id).map(|r| r.clone())
    }

    fn active_waypoints(&self, route_id: &str) -> Vec<Waypoint> {
        match self.waypoints.get(route_id) {
            Some(wps) => wps.iter().filter(|w| w.active).cloned().collect(),
            None => Vec::new(),
        }
    }
}
