//! Position report ingestion.
//!
//! The single write path for vehicle state. Reports are validated,
//! ordered by device timestamp, and rate-limited per vehicle: reports
//! arriving faster than the configured minimum interval are coalesced
//! so only the most recent is applied when the interval elapses.
//!
//! Vehicle state is partitioned by vehicle identifier. Each vehicle
//! owns a slot behind its own async mutex, so concurrent reports for
//! one vehicle serialize while distinct vehicles never contend.
//!
//! Every applied update is emitted exactly once on the applied-update
//! channel consumed by the engine pump (one broadcast, one proximity
//! evaluation per applied update).

use crate::error::{Result, TrackerError};
use crate::fleet::FleetDirectory;
use crate::types::{now_ms, LocationReport, VehicleState, VehicleStatus};
use dashmap::DashMap;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Result of an accepted report.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// The report replaced the vehicle state and was broadcast.
    Applied(VehicleState),
    /// The report was queued; the newest queued report is applied when
    /// the rate-limit interval elapses.
    Coalesced,
}

#[derive(Default)]
struct VehicleSlot {
    state: Option<VehicleState>,
    /// Most recent report waiting out the rate-limit interval.
    pending: Option<LocationReport>,
    flush_scheduled: bool,
    /// Wall-clock time of the last applied update.
    last_applied_wall: i64,
}

pub struct LocationIngestor {
    vehicles: DashMap<String, Arc<Mutex<VehicleSlot>>>,
    fleet: Arc<dyn FleetDirectory>,
    applied_tx: mpsc::UnboundedSender<VehicleState>,
    min_interval_ms: i64,
}

impl LocationIngestor {
    /// Create an ingestor and the channel of applied updates.
    pub fn new(
        min_interval_ms: i64,
        fleet: Arc<dyn FleetDirectory>,
    ) -> (Self, mpsc::UnboundedReceiver<VehicleState>) {
        let (applied_tx, applied_rx) = mpsc::unbounded_channel();
        (
            Self {
                vehicles: DashMap::new(),
                fleet,
                applied_tx,
                min_interval_ms,
            },
            applied_rx,
        )
    }

    fn validate(report: &LocationReport) -> Result<()> {
        if !report.position.is_valid() {
            return Err(TrackerError::InvalidReport(
                "position coordinates must be finite".to_string(),
            ));
        }
        if !report.speed.is_finite() || report.speed < 0.0 {
            return Err(TrackerError::InvalidReport(
                "speed must be non-negative".to_string(),
            ));
        }
        if let Some(heading) = report.heading {
            if heading > 359 {
                return Err(TrackerError::InvalidReport(
                    "heading must be 0-359 degrees".to_string(),
                ));
            }
        }
        if let Some(accuracy) = report.accuracy {
            if !accuracy.is_finite() || accuracy < 0.0 {
                return Err(TrackerError::InvalidReport(
                    "accuracy must be non-negative".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Ingest one position report for a vehicle.
    ///
    /// Out-of-order reports are dropped with `StaleReport`; a stored
    /// valid position is never replaced by a worse-ordered one. Equal
    /// timestamps are accepted (two fixes can share a millisecond).
    pub async fn ingest(&self, vehicle_id: &str, report: LocationReport) -> Result<IngestOutcome> {
        Self::validate(&report)?;

        let slot = self.slot(vehicle_id);
        let mut guard = slot.lock().await;

        if let Some(state) = &guard.state {
            if report.timestamp_ms < state.updated_at {
                counter!("tracker_reports_stale_total").increment(1);
                return Err(TrackerError::StaleReport);
            }
        }
        if let Some(pending) = &guard.pending {
            if report.timestamp_ms < pending.timestamp_ms {
                counter!("tracker_reports_stale_total").increment(1);
                return Err(TrackerError::StaleReport);
            }
        }

        let now = now_ms();
        let elapsed = now - guard.last_applied_wall;
        if guard.state.is_some() && elapsed < self.min_interval_ms {
            guard.pending = Some(report);
            if !guard.flush_scheduled {
                guard.flush_scheduled = true;
                let delay = (self.min_interval_ms - elapsed).max(1) as u64;
                self.schedule_flush(Arc::clone(&slot), vehicle_id.to_string(), delay);
            }
            counter!("tracker_reports_coalesced_total").increment(1);
            debug!("Coalesced report for {}", vehicle_id);
            return Ok(IngestOutcome::Coalesced);
        }

        let state = apply_locked(&mut guard, vehicle_id, report, now, &self.fleet, &self.applied_tx);
        Ok(IngestOutcome::Applied(state))
    }

    /// Spawn the deferred flush that applies the newest coalesced
    /// report once the rate-limit interval has elapsed.
    fn schedule_flush(&self, slot: Arc<Mutex<VehicleSlot>>, vehicle_id: String, delay_ms: u64) {
        let fleet = Arc::clone(&self.fleet);
        let applied_tx = self.applied_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let mut guard = slot.lock().await;
            guard.flush_scheduled = false;
            let Some(report) = guard.pending.take() else {
                return;
            };
            if let Some(state) = &guard.state {
                if report.timestamp_ms < state.updated_at {
                    return;
                }
            }
            apply_locked(&mut guard, &vehicle_id, report, now_ms(), &fleet, &applied_tx);
            debug!("Flushed coalesced report for {}", vehicle_id);
        });
    }

    /// Record an operational-status change from the fleet collaborator.
    /// Leaving operational/idle suspends proximity evaluation.
    pub async fn set_status(&self, vehicle_id: &str, status: VehicleStatus) -> Result<()> {
        let slot = self
            .vehicles
            .get(vehicle_id)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| TrackerError::NotFound(vehicle_id.to_string()))?;
        let mut guard = slot.lock().await;
        match guard.state.as_mut() {
            Some(state) => {
                state.status = status;
                Ok(())
            }
            None => Err(TrackerError::NotFound(vehicle_id.to_string())),
        }
    }

    /// Last applied state of one vehicle.
    pub async fn state(&self, vehicle_id: &str) -> Option<VehicleState> {
        let slot = self.vehicles.get(vehicle_id).map(|s| Arc::clone(&s))?;
        let guard = slot.lock().await;
        guard.state.clone()
    }

    /// Snapshot of every tracked vehicle's last state.
    pub async fn snapshot(&self) -> Vec<VehicleState> {
        let slots: Vec<Arc<Mutex<VehicleSlot>>> =
            self.vehicles.iter().map(|e| Arc::clone(e.value())).collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(state) = &slot.lock().await.state {
                out.push(state.clone());
            }
        }
        out
    }

    pub fn vehicle_count(&self) -> usize {
        self.vehicles.len()
    }

    fn slot(&self, vehicle_id: &str) -> Arc<Mutex<VehicleSlot>> {
        self.vehicles
            .entry(vehicle_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VehicleSlot::default())))
            .clone()
    }
}

/// Replace the vehicle state under its slot lock and emit the applied
/// update. Shared by the direct ingest path and the deferred flush.
fn apply_locked(
    guard: &mut VehicleSlot,
    vehicle_id: &str,
    report: LocationReport,
    now: i64,
    fleet: &Arc<dyn FleetDirectory>,
    applied_tx: &mpsc::UnboundedSender<VehicleState>,
) -> VehicleState {
    let status = guard
        .state
        .as_ref()
        .map(|s| s.status)
        .unwrap_or(VehicleStatus::Operational);
    let state = VehicleState {
        vehicle_id: vehicle_id.to_string(),
        position: report.position,
        heading: report.heading,
        speed: report.speed,
        accuracy: report.accuracy,
        route_id: fleet.assigned_route(vehicle_id),
        status,
        updated_at: report.timestamp_ms,
    };
    guard.state = Some(state.clone());
    guard.last_applied_wall = now;
    counter!("tracker_reports_applied_total").increment(1);
    // Receiver gone means the engine pump stopped; nothing to do.
    let _ = applied_tx.send(state.clone());
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::StaticFleet;
    use crate::types::Position;

    fn make_ingestor(min_interval_ms: i64) -> (Arc<LocationIngestor>, mpsc::UnboundedReceiver<VehicleState>) {
        let fleet = Arc::new(StaticFleet::new());
        fleet.assign_vehicle("bus-12", "r4");
        let (ingestor, rx) = LocationIngestor::new(min_interval_ms, fleet);
        (Arc::new(ingestor), rx)
    }

    fn report(lat: f64, ts: i64) -> LocationReport {
        LocationReport {
            position: Position::new(lat, 38.7469),
            heading: Some(90),
            speed: 8.0,
            accuracy: Some(5.0),
            timestamp_ms: ts,
        }
    }

    #[tokio::test]
    async fn test_applied_report_replaces_state() {
        let (ingestor, mut rx) = make_ingestor(0);
        let outcome = ingestor.ingest("bus-12", report(9.03, 1_000)).await.unwrap();
        let state = match outcome {
            IngestOutcome::Applied(s) => s,
            other => panic!("expected applied, got {:?}", other),
        };
        assert_eq!(state.route_id.as_deref(), Some("r4"));
        assert_eq!(state.status, VehicleStatus::Operational);
        assert_eq!(rx.recv().await.unwrap().updated_at, 1_000);

        ingestor.ingest("bus-12", report(9.04, 2_000)).await.unwrap();
        let stored = ingestor.state("bus-12").await.unwrap();
        assert_eq!(stored.updated_at, 2_000);
        assert_eq!(stored.position.lat, 9.04);
    }

    #[tokio::test]
    async fn test_stale_report_dropped() {
        let (ingestor, _rx) = make_ingestor(0);
        ingestor.ingest("bus-12", report(9.03, 2_000)).await.unwrap();

        let err = ingestor.ingest("bus-12", report(9.05, 1_000)).await.unwrap_err();
        assert!(matches!(err, TrackerError::StaleReport));

        // state unchanged
        let stored = ingestor.state("bus-12").await.unwrap();
        assert_eq!(stored.updated_at, 2_000);
        assert_eq!(stored.position.lat, 9.03);
    }

    #[tokio::test]
    async fn test_invalid_report_rejected() {
        let (ingestor, _rx) = make_ingestor(0);

        let mut bad = report(9.03, 1_000);
        bad.position = Position::new(f64::NAN, 38.7);
        assert!(matches!(
            ingestor.ingest("bus-12", bad).await,
            Err(TrackerError::InvalidReport(_))
        ));

        let mut bad = report(9.03, 1_000);
        bad.speed = -1.0;
        assert!(matches!(
            ingestor.ingest("bus-12", bad).await,
            Err(TrackerError::InvalidReport(_))
        ));

        let mut bad = report(9.03, 1_000);
        bad.heading = Some(400);
        assert!(matches!(
            ingestor.ingest("bus-12", bad).await,
            Err(TrackerError::InvalidReport(_))
        ));

        assert!(ingestor.state("bus-12").await.is_none());
    }

    #[tokio::test]
    async fn test_burst_is_coalesced_to_newest() {
        let (ingestor, mut rx) = make_ingestor(100);

        let first = ingestor.ingest("bus-12", report(9.03, 1_000)).await.unwrap();
        assert!(matches!(first, IngestOutcome::Applied(_)));

        let second = ingestor.ingest("bus-12", report(9.04, 1_010)).await.unwrap();
        assert!(matches!(second, IngestOutcome::Coalesced));
        let third = ingestor.ingest("bus-12", report(9.05, 1_020)).await.unwrap();
        assert!(matches!(third, IngestOutcome::Coalesced));

        // wait out the interval for the flush task
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stored = ingestor.state("bus-12").await.unwrap();
        assert_eq!(stored.updated_at, 1_020);
        assert_eq!(stored.position.lat, 9.05);

        // exactly two applied updates reached the channel: the first
        // report and the flushed newest one
        assert_eq!(rx.recv().await.unwrap().updated_at, 1_000);
        assert_eq!(rx.recv().await.unwrap().updated_at, 1_020);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_distinct_vehicles_are_independent() {
        let (ingestor, _rx) = make_ingestor(60_000);
        ingestor.ingest("bus-12", report(9.03, 1_000)).await.unwrap();
        // a second vehicle inside bus-12's rate window still applies
        let outcome = ingestor.ingest("bus-13", report(9.04, 1_001)).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Applied(_)));
        assert_eq!(ingestor.vehicle_count(), 2);
    }

    #[tokio::test]
    async fn test_set_status() {
        let (ingestor, _rx) = make_ingestor(0);
        assert!(matches!(
            ingestor.set_status("bus-12", VehicleStatus::Maintenance).await,
            Err(TrackerError::NotFound(_))
        ));

        ingestor.ingest("bus-12", report(9.03, 1_000)).await.unwrap();
        ingestor
            .set_status("bus-12", VehicleStatus::Maintenance)
            .await
            .unwrap();
        let stored = ingestor.state("bus-12").await.unwrap();
        assert_eq!(stored.status, VehicleStatus::Maintenance);
    }

    #[tokio::test]
    async fn test_snapshot() {
        let (ingestor, _rx) = make_ingestor(0);
        ingestor.ingest("bus-12", report(9.03, 1_000)).await.unwrap();
        ingestor.ingest("bus-13", report(9.04, 1_000)).await.unwrap();
        let mut ids: Vec<String> = ingestor
            .snapshot()
            .await
            .into_iter()
            .map(|s| s.vehicle_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["bus-12".to_string(), "bus-13".to_string()]);
    }
}
