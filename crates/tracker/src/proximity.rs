//! Vehicle-to-target proximity evaluation with edge-triggered alerting.
//!
//! Each (vehicle, target) pair carries an explicit two-state watch:
//! `Outside` or `Inside` the proximity threshold. An alert fires only
//! on the Outside→Inside transition; staying inside is silent, and any
//! evaluation back above the threshold re-arms the watch. A single
//! threshold is used in both directions (no hysteresis), so flapping
//! exactly at the boundary re-alerts on each re-entry.
//!
//! The caller invokes [`ProximityEngine::evaluate`] once per applied
//! vehicle update from the engine pump, which serializes evaluations
//! per vehicle; the watch table itself is DashMap sharded.

use crate::fleet::FleetDirectory;
use crate::geo;
use crate::privacy::PrivacyGate;
use crate::registry::ConnectionRegistry;
use crate::rooms::{vehicle_room, RoomBroker};
use crate::types::{now_ms, Position, Role, VehicleState};
use dashmap::DashMap;
use metrics::counter;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Default proximity threshold in meters.
pub const DEFAULT_THRESHOLD_M: f64 = 500.0;

/// What a vehicle is being watched against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchTarget {
    Waypoint(String),
    Subscriber(String),
}

/// Key of one edge-trigger record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchKey {
    pub vehicle_id: String,
    pub target: WatchTarget,
}

/// Threshold side of a watched pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThresholdSide {
    Outside,
    Inside,
}

#[derive(Debug, Clone, Copy)]
struct Watch {
    side: ThresholdSide,
    changed_at: i64,
}

/// One emitted proximity event, consumed by the notification emitter.
#[derive(Debug, Clone)]
pub struct ProximityEvent {
    pub vehicle_id: String,
    pub target: WatchTarget,
    pub target_name: Option<String>,
    pub distance_m: f64,
    /// Vehicle speed at the triggering evaluation, m/s.
    pub speed_mps: f64,
    pub timestamp_ms: i64,
}

pub struct ProximityEngine {
    fleet: Arc<dyn FleetDirectory>,
    gate: Arc<PrivacyGate>,
    broker: Arc<RoomBroker>,
    registry: Arc<ConnectionRegistry>,
    watches: DashMap<WatchKey, Watch>,
    /// Route seen at the previous evaluation, per vehicle. A change
    /// invalidates every watch the vehicle holds.
    last_route: DashMap<String, Option<String>>,
    threshold_m: f64,
}

impl ProximityEngine {
    pub fn new(
        threshold_m: f64,
        fleet: Arc<dyn FleetDirectory>,
        gate: Arc<PrivacyGate>,
        broker: Arc<RoomBroker>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            fleet,
            gate,
            broker,
            registry,
            watches: DashMap::new(),
            last_route: DashMap::new(),
            threshold_m,
        }
    }

    /// Evaluate one vehicle against its route's waypoints and the
    /// opted-in subscribers watching it. Returns the alerts produced
    /// by Outside→Inside transitions, at most one per pair.
    pub fn evaluate(&self, state: &VehicleState) -> Vec<ProximityEvent> {
        // Out-of-service vehicles are not evaluated.
        if !state.status.is_tracking() {
            return Vec::new();
        }
        if !state.position.is_valid() {
            return Vec::new();
        }

        // Route reassignment (including going off-route) invalidates
        // the vehicle's watch set so re-entries alert afresh.
        let prev_route = self
            .last_route
            .insert(state.vehicle_id.clone(), state.route_id.clone());
        if let Some(prev) = prev_route {
            if prev != state.route_id {
                self.evict_vehicle(&state.vehicle_id);
            }
        }

        let Some(route_id) = state.route_id.as_deref() else {
            return Vec::new();
        };

        let mut events = Vec::new();
        let mut seen: HashSet<WatchKey> = HashSet::new();

        for waypoint in self.fleet.active_waypoints(route_id) {
            if !waypoint.position.is_valid() {
                continue;
            }
            let key = WatchKey {
                vehicle_id: state.vehicle_id.clone(),
                target: WatchTarget::Waypoint(waypoint.waypoint_id.clone()),
            };
            seen.insert(key.clone());
            if let Some(event) =
                self.step(key, state, waypoint.position, Some(waypoint.name.clone()))
            {
                events.push(event);
            }
        }

        for (actor_id, position) in self.sharing_subscribers(&state.vehicle_id) {
            let key = WatchKey {
                vehicle_id: state.vehicle_id.clone(),
                target: WatchTarget::Subscriber(actor_id),
            };
            seen.insert(key.clone());
            if let Some(event) = self.step(key, state, position, None) {
                events.push(event);
            }
        }

        // Watches whose target left the evaluation set (waypoint
        // deactivated, subscriber gone) are no longer relevant.
        self.watches
            .retain(|key, _| key.vehicle_id != state.vehicle_id || seen.contains(key));

        if !events.is_empty() {
            counter!("tracker_alerts_emitted_total").increment(events.len() as u64);
        }
        events
    }

    /// Advance one watch and return an event on the Outside→Inside edge.
    fn step(
        &self,
        key: WatchKey,
        state: &VehicleState,
        target_position: Position,
        target_name: Option<String>,
    ) -> Option<ProximityEvent> {
        let distance = geo::distance_m(state.position, target_position);
        let inside = distance <= self.threshold_m;
        let now = now_ms();

        let mut watch = self.watches.entry(key.clone()).or_insert(Watch {
            side: ThresholdSide::Outside,
            changed_at: now,
        });

        match (watch.side, inside) {
            (ThresholdSide::Outside, true) => {
                watch.side = ThresholdSide::Inside;
                watch.changed_at = now;
                debug!(
                    "Vehicle {} entered {:?} threshold at {:.0} m",
                    key.vehicle_id, key.target, distance
                );
                Some(ProximityEvent {
                    vehicle_id: key.vehicle_id,
                    target: key.target,
                    target_name,
                    distance_m: distance,
                    speed_mps: state.speed,
                    timestamp_ms: now,
                })
            }
            (ThresholdSide::Inside, false) => {
                watch.side = ThresholdSide::Outside;
                watch.changed_at = now;
                None
            }
            // Self-transitions are silent.
            _ => None,
        }
    }

    /// Opted-in subscribers currently in the vehicle's room, with their
    /// shared positions. Positions come only from the privacy gate.
    fn sharing_subscribers(&self, vehicle_id: &str) -> Vec<(String, Position)> {
        let mut seen_actors = HashSet::new();
        let mut out = Vec::new();
        for conn_id in self.broker.members(&vehicle_room(vehicle_id)) {
            let Some(conn) = self.registry.get(&conn_id) else {
                continue;
            };
            if conn.role != Role::Subscriber {
                continue;
            }
            if !seen_actors.insert(conn.actor_id.clone()) {
                continue;
            }
            if let Some(position) = self.gate.position(&conn.actor_id) {
                out.push((conn.actor_id.clone(), position));
            }
        }
        out
    }

    /// Drop every watch held by one vehicle.
    pub fn evict_vehicle(&self, vehicle_id: &str) {
        self.watches.retain(|key, _| key.vehicle_id != vehicle_id);
    }

    /// Drop every watch against one subscriber (used on opt-out).
    pub fn evict_subscriber(&self, actor_id: &str) {
        self.watches
            .retain(|key, _| key.target != WatchTarget::Subscriber(actor_id.to_string()));
    }

    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::StaticFleet;
    use crate::registry::Connection;
    use crate::types::{VehicleStatus, Waypoint};
    use tokio::sync::mpsc;

    struct Fixture {
        fleet: Arc<StaticFleet>,
        gate: Arc<PrivacyGate>,
        broker: Arc<RoomBroker>,
        registry: Arc<ConnectionRegistry>,
        engine: ProximityEngine,
    }

    fn fixture() -> Fixture {
        let fleet = Arc::new(StaticFleet::new());
        let gate = Arc::new(PrivacyGate::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let broker = Arc::new(RoomBroker::new(Arc::clone(&registry)));
        let engine = ProximityEngine::new(
            DEFAULT_THRESHOLD_M,
            Arc::clone(&fleet) as Arc<dyn FleetDirectory>,
            Arc::clone(&gate),
            Arc::clone(&broker),
            Arc::clone(&registry),
        );
        Fixture {
            fleet,
            gate,
            broker,
            registry,
            engine,
        }
    }

    fn seed_route(fleet: &StaticFleet) {
        fleet.assign_vehicle("bus-12", "r4");
        fleet.set_waypoints(
            "r4",
            vec![Waypoint {
                waypoint_id: "wp-1".to_string(),
                position: Position::new(9.0325, 38.7469),
                name: "Central".to_string(),
                active: true,
            }],
        );
    }

    fn state_at(lat: f64, lon: f64) -> VehicleState {
        VehicleState {
            vehicle_id: "bus-12".to_string(),
            position: Position::new(lat, lon),
            heading: Some(0),
            speed: 8.0,
            accuracy: None,
            route_id: Some("r4".to_string()),
            status: VehicleStatus::Operational,
            updated_at: 1_000,
        }
    }

    #[tokio::test]
    async fn test_alert_only_on_entry_edge() {
        let f = fixture();
        seed_route(&f.fleet);

        // ~3 km south of the waypoint: outside, no alert
        let events = f.engine.evaluate(&state_at(9.0050, 38.7469));
        assert!(events.is_empty());

        // at the waypoint: inside, exactly one alert for the pair
        let events = f.engine.evaluate(&state_at(9.0325, 38.7469));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].vehicle_id, "bus-12");
        assert_eq!(
            events[0].target,
            WatchTarget::Waypoint("wp-1".to_string())
        );
        assert!(events[0].distance_m < DEFAULT_THRESHOLD_M);

        // lingering inside stays silent
        let events = f.engine.evaluate(&state_at(9.0326, 38.7469));
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_exit_rearms_for_reentry() {
        let f = fixture();
        seed_route(&f.fleet);

        f.engine.evaluate(&state_at(9.0050, 38.7469));
        assert_eq!(f.engine.evaluate(&state_at(9.0325, 38.7469)).len(), 1);

        // leave the threshold: silent reset
        assert!(f.engine.evaluate(&state_at(9.0050, 38.7469)).is_empty());

        // re-entry alerts again
        assert_eq!(f.engine.evaluate(&state_at(9.0325, 38.7469)).len(), 1);
    }

    #[tokio::test]
    async fn test_first_observation_inside_alerts_once() {
        let f = fixture();
        seed_route(&f.fleet);

        // first ever evaluation already inside the threshold
        let events = f.engine.evaluate(&state_at(9.0325, 38.7469));
        assert_eq!(events.len(), 1);
        assert!(f.engine.evaluate(&state_at(9.0325, 38.7469)).is_empty());
    }

    #[tokio::test]
    async fn test_out_of_service_vehicle_skipped() {
        let f = fixture();
        seed_route(&f.fleet);

        let mut state = state_at(9.0325, 38.7469);
        state.status = VehicleStatus::Breakdown;
        assert!(f.engine.evaluate(&state).is_empty());

        state.status = VehicleStatus::Maintenance;
        assert!(f.engine.evaluate(&state).is_empty());
    }

    #[tokio::test]
    async fn test_route_reassignment_evicts_watches() {
        let f = fixture();
        seed_route(&f.fleet);
        f.fleet.set_waypoints(
            "r5",
            vec![Waypoint {
                waypoint_id: "wp-1".to_string(),
                position: Position::new(9.0325, 38.7469),
                name: "Central".to_string(),
                active: true,
            }],
        );

        assert_eq!(f.engine.evaluate(&state_at(9.0325, 38.7469)).len(), 1);
        assert_eq!(f.engine.watch_count(), 1);

        // same waypoint id now reached via a different route: the old
        // watch is gone, so entry alerts again
        let mut state = state_at(9.0325, 38.7469);
        state.route_id = Some("r5".to_string());
        assert_eq!(f.engine.evaluate(&state).len(), 1);
    }

    #[tokio::test]
    async fn test_deactivated_waypoint_watch_pruned() {
        let f = fixture();
        seed_route(&f.fleet);

        assert_eq!(f.engine.evaluate(&state_at(9.0325, 38.7469)).len(), 1);
        assert_eq!(f.engine.watch_count(), 1);

        f.fleet.set_waypoints("r4", Vec::new());
        assert!(f.engine.evaluate(&state_at(9.0325, 38.7469)).is_empty());
        assert_eq!(f.engine.watch_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_proximity_through_gate_only() {
        let f = fixture();
        f.fleet.assign_vehicle("bus-12", "r4");
        f.fleet.set_waypoints("r4", Vec::new());

        // subscriber in the vehicle room, sharing enabled
        let (tx, _rx) = mpsc::channel(8);
        let conn = Arc::new(Connection::new("rider-1", Role::Subscriber, tx));
        let conn_id = f.registry.register(conn).unwrap();
        f.broker.join(&conn_id, &vehicle_room("bus-12")).unwrap();

        // not opted in yet: ignored
        assert!(f.engine.evaluate(&state_at(9.0325, 38.7469)).is_empty());

        f.gate.enable_sharing("rider-1");
        f.gate
            .update_position("rider-1", Position::new(9.0325, 38.7469))
            .unwrap();

        let events = f.engine.evaluate(&state_at(9.0325, 38.7469));
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].target,
            WatchTarget::Subscriber("rider-1".to_string())
        );
    }

    #[tokio::test]
    async fn test_opt_out_removes_subscriber_from_evaluation() {
        let f = fixture();
        f.fleet.assign_vehicle("bus-12", "r4");
        f.fleet.set_waypoints("r4", Vec::new());

        let (tx, _rx) = mpsc::channel(8);
        let conn = Arc::new(Connection::new("rider-1", Role::Subscriber, tx));
        let conn_id = f.registry.register(conn).unwrap();
        f.broker.join(&conn_id, &vehicle_room("bus-12")).unwrap();

        f.gate.enable_sharing("rider-1");
        f.gate
            .update_position("rider-1", Position::new(9.0325, 38.7469))
            .unwrap();
        assert_eq!(f.engine.evaluate(&state_at(9.0325, 38.7469)).len(), 1);

        f.gate.disable_sharing("rider-1");
        f.engine.evict_subscriber("rider-1");

        // far away and back: no alert without sharing
        assert!(f.engine.evaluate(&state_at(9.0050, 38.7469)).is_empty());
        assert!(f.engine.evaluate(&state_at(9.0325, 38.7469)).is_empty());
        assert_eq!(f.engine.watch_count(), 0);
    }
}
