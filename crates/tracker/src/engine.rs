//! Engine assembly and the applied-update pump.
//!
//! One `Engine` is constructed at process start and injected wherever
//! the transport layer needs it; there are no ambient globals. The
//! pump is the single serialized writer for location broadcasts: it
//! consumes applied updates from the ingestor, fans each one out to
//! the vehicle, route, and global rooms, then runs the proximity
//! evaluation for that update.

use crate::error::Result;
use crate::fleet::FleetDirectory;
use crate::ingest::LocationIngestor;
use crate::notify::{NotificationEmitter, NotificationStore};
use crate::privacy::PrivacyGate;
use crate::protocol::ServerMessage;
use crate::proximity::ProximityEngine;
use crate::registry::{Connection, ConnectionId, ConnectionRegistry};
use crate::rooms::{route_room, vehicle_room, RoomBroker, RoomKind, GLOBAL_ROOM};
use crate::types::{Role, VehicleState};
use axum::extract::ws::Message;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Distance below which a vehicle is "near" a target, meters.
    pub proximity_threshold_m: f64,
    /// Reports for one vehicle arriving faster than this are coalesced.
    pub min_report_interval_ms: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            proximity_threshold_m: crate::proximity::DEFAULT_THRESHOLD_M,
            min_report_interval_ms: 1_000,
        }
    }
}

/// The live tracking engine: registry, broker, ingestor, privacy gate,
/// proximity evaluation, and notification dispatch, wired together.
pub struct Engine {
    pub registry: Arc<ConnectionRegistry>,
    pub broker: Arc<RoomBroker>,
    pub ingestor: Arc<LocationIngestor>,
    pub gate: Arc<PrivacyGate>,
    pub proximity: Arc<ProximityEngine>,
    pub emitter: Arc<NotificationEmitter>,
    applied_rx: StdMutex<Option<mpsc::UnboundedReceiver<VehicleState>>>,
    shutdown_tx: StdMutex<Option<mpsc::Sender<()>>>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        fleet: Arc<dyn FleetDirectory>,
        store: Arc<dyn NotificationStore>,
    ) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let broker = Arc::new(RoomBroker::new(Arc::clone(&registry)));
        let gate = Arc::new(PrivacyGate::new());
        let (ingestor, applied_rx) =
            LocationIngestor::new(config.min_report_interval_ms, Arc::clone(&fleet));
        let proximity = Arc::new(ProximityEngine::new(
            config.proximity_threshold_m,
            fleet,
            Arc::clone(&gate),
            Arc::clone(&broker),
            Arc::clone(&registry),
        ));
        let emitter = Arc::new(NotificationEmitter::new(
            Arc::clone(&broker),
            Arc::clone(&registry),
            store,
        ));

        Arc::new(Self {
            registry,
            broker,
            ingestor: Arc::new(ingestor),
            gate,
            proximity,
            emitter,
            applied_rx: StdMutex::new(Some(applied_rx)),
            shutdown_tx: StdMutex::new(None),
            pump: StdMutex::new(None),
        })
    }

    /// Spawn the applied-update pump. Call once at startup.
    pub fn start(&self) {
        let Some(mut applied_rx) = self.applied_rx.lock().expect("engine lock").take() else {
            warn!("Engine already started");
            return;
        };
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.lock().expect("engine lock") = Some(shutdown_tx);

        let broker = Arc::clone(&self.broker);
        let proximity = Arc::clone(&self.proximity);
        let emitter = Arc::clone(&self.emitter);
        let handle = tokio::spawn(async move {
            info!("Engine pump running");
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => {
                        info!("Engine pump received shutdown signal");
                        break;
                    }

                    update = applied_rx.recv() => {
                        match update {
                            Some(state) => handle_update(&broker, &proximity, &emitter, state),
                            None => {
                                warn!("Applied-update channel closed");
                                break;
                            }
                        }
                    }
                }
            }
            info!("Engine pump stopped");
        });
        *self.pump.lock().expect("engine lock") = Some(handle);
    }

    /// Shut the pump down and wait for it to finish.
    pub async fn stop(&self) {
        let tx = self.shutdown_tx.lock().expect("engine lock").take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
        let handle = self.pump.lock().expect("engine lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Transport hook: a channel was established for an authenticated
    /// actor. Returns the connection identifier.
    pub fn connect(
        &self,
        actor_id: &str,
        role: Role,
        tx: mpsc::Sender<Message>,
    ) -> Result<ConnectionId> {
        let conn = Arc::new(Connection::new(actor_id, role, tx));
        self.registry.register(conn)
    }

    /// Transport hook: a channel closed. Synchronously removes the
    /// connection from the registry and every room; idempotent.
    pub fn disconnect(&self, conn_id: &ConnectionId) {
        self.broker.disconnect(conn_id);
    }

    /// Flip location sharing for a subscriber. Disabling clears stored
    /// position and drops the subscriber's proximity watches.
    pub fn toggle_sharing(&self, actor_id: &str, enabled: bool) {
        if enabled {
            self.gate.enable_sharing(actor_id);
        } else {
            self.gate.disable_sharing(actor_id);
            self.proximity.evict_subscriber(actor_id);
        }
    }

    /// Disconnect connections with no activity for `max_idle_ms`.
    /// Returns how many were removed.
    pub fn sweep_stale(&self, max_idle_ms: i64) -> usize {
        let stale = self.registry.stale_ids(max_idle_ms);
        let count = stale.len();
        for id in &stale {
            warn!("Sweeping stale connection {}", id);
            self.broker.disconnect(id);
        }
        count
    }

    /// Vehicle states relevant to a room, for the snapshot sent on join.
    pub async fn snapshot_for_room(&self, room_id: &str) -> Vec<VehicleState> {
        match RoomKind::parse(room_id) {
            Some(RoomKind::Vehicle(vehicle_id)) => {
                self.ingestor.state(&vehicle_id).await.into_iter().collect()
            }
            Some(RoomKind::Route(route_id)) => self
                .ingestor
                .snapshot()
                .await
                .into_iter()
                .filter(|s| s.route_id.as_deref() == Some(route_id.as_str()))
                .collect(),
            Some(RoomKind::Global) => self.ingestor.snapshot().await,
            None => Vec::new(),
        }
    }
}

/// Broadcast one applied update and evaluate proximity for it. Runs on
/// the pump task, the single serialized writer for location broadcasts.
fn handle_update(
    broker: &Arc<RoomBroker>,
    proximity: &Arc<ProximityEngine>,
    emitter: &Arc<NotificationEmitter>,
    state: VehicleState,
) {
    let msg = ServerMessage::VehicleUpdate(state.clone());
    broker.publish(&vehicle_room(&state.vehicle_id), &msg);
    if let Some(route_id) = &state.route_id {
        broker.publish(&route_room(route_id), &msg);
    }
    broker.publish(GLOBAL_ROOM, &msg);

    for event in proximity.evaluate(&state) {
        emitter.emit(&event);
    }
}
