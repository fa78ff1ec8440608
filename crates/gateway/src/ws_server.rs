//! WebSocket server handler using Axum.
//!
//! One read loop and one write task per connection. The identity layer
//! in front of this service authenticates the actor and passes the
//! resulting identity as query parameters on the upgrade request; no
//! credential verification happens here.

use crate::error::{GatewayError, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use tracker::{
    ClientMessage, Connection, Engine, Role, ServerMessage, OUTBOUND_BUFFER_SIZE,
};

/// Shared application state.
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Authenticated identity attached to the upgrade request.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub actor_id: String,
    pub role: Role,
}

/// Create the WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connections = state.engine.registry.connection_count();
    let rooms = state.engine.broker.room_count();
    let vehicles = state.engine.ingestor.vehicle_count();
    format!(
        r#"{{"status":"ok","connections":{},"rooms":{},"vehicles":{}}}"#,
        connections, rooms, vehicles
    )
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

/// Handle a WebSocket connection from accept to close.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, params: ConnectParams) {
    // Split the socket into sender and receiver
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Bounded channel for outgoing messages; overflow disconnects.
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER_SIZE);

    let conn_id = match state.engine.connect(&params.actor_id, params.role, tx) {
        Ok(id) => id,
        Err(e) => {
            warn!("Rejecting connection for {}: {}", params.actor_id, e);
            return;
        }
    };
    // Registered a moment ago; only this task unregisters it.
    let conn = state
        .engine
        .registry
        .get(&conn_id)
        .expect("connection just registered");

    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections")
        .set(state.engine.registry.connection_count() as f64);

    info!(
        "Connection {} established for {} ({:?})",
        conn_id, params.actor_id, params.role
    );

    // Forward messages from the channel to the WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Ping interval for keepalive
    let mut ping_interval = interval(Duration::from_secs(30));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if let Err(e) = handle_message(&state, &conn, msg).await {
                            warn!("Error handling message from {}: {:?}", conn_id, e);
                            let _ = conn.send(&ServerMessage::Error {
                                message: e.to_string(),
                                code: e.code().to_string(),
                            });
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", conn_id, e);
                        break;
                    }
                    None => {
                        // Connection closed
                        break;
                    }
                }
            }

            _ = ping_interval.tick() => {
                if !conn.try_send_raw(Message::Ping(vec![].into())) {
                    break;
                }
            }
        }
    }

    // Synchronous cleanup: registry entry and all room memberships go
    // before this task returns; in-flight publishes to the gone
    // connection are discarded without error.
    state.engine.disconnect(&conn_id);
    send_task.abort();

    counter!("gateway_disconnections_total").increment(1);
    gauge!("gateway_active_connections")
        .set(state.engine.registry.connection_count() as f64);

    info!("Connection {} closed", conn_id);
}

/// Handle a single WebSocket frame.
async fn handle_message(
    state: &Arc<AppState>,
    conn: &Arc<Connection>,
    msg: Message,
) -> Result<()> {
    match msg {
        Message::Text(text) => {
            let client_msg: ClientMessage = serde_json::from_str(&text)?;
            handle_client_message(state, conn, client_msg).await
        }
        Message::Binary(data) => {
            let client_msg: ClientMessage = serde_json::from_slice(&data)?;
            handle_client_message(state, conn, client_msg).await
        }
        Message::Ping(data) => {
            conn.touch();
            if !conn.try_send_raw(Message::Pong(data)) {
                return Err(GatewayError::ChannelSend);
            }
            Ok(())
        }
        Message::Pong(_) => {
            conn.touch();
            Ok(())
        }
        Message::Close(_) => {
            // The connection loop observes the close on its own.
            Ok(())
        }
    }
}

/// Handle a parsed client message.
async fn handle_client_message(
    state: &Arc<AppState>,
    conn: &Arc<Connection>,
    msg: ClientMessage,
) -> Result<()> {
    conn.touch();
    let engine = &state.engine;

    match msg {
        ClientMessage::JoinRoom { room } => {
            debug!("Connection {} joining {}", conn.id, room);
            engine.broker.join(&conn.id, &room)?;
            conn.send(&ServerMessage::RoomJoined { room: room.clone() })?;

            // Current fleet state so the client renders immediately.
            let vehicles = engine.snapshot_for_room(&room).await;
            if !vehicles.is_empty() {
                conn.send(&ServerMessage::FleetSnapshot { vehicles })?;
            }
            counter!("gateway_room_joins_total").increment(1);
            Ok(())
        }
        ClientMessage::LeaveRoom { room } => {
            debug!("Connection {} leaving {}", conn.id, room);
            engine.broker.leave(&conn.id, &room)?;
            conn.send(&ServerMessage::RoomLeft { room })?;
            Ok(())
        }
        ClientMessage::VehicleLocation { vehicle_id, report } => {
            if !matches!(conn.role, Role::Driver | Role::Staff) {
                return Err(GatewayError::Forbidden(
                    "only drivers and staff may report vehicle positions".to_string(),
                ));
            }
            // Broadcast and evaluation run on the engine pump once the
            // report is applied; coalesced reports are silently queued.
            engine.ingestor.ingest(&vehicle_id, report).await?;
            counter!("gateway_reports_received_total").increment(1);
            Ok(())
        }
        ClientMessage::SubscriberLocation { position } => {
            if conn.role != Role::Subscriber {
                return Err(GatewayError::Forbidden(
                    "only subscribers may share their position".to_string(),
                ));
            }
            engine.gate.update_position(&conn.actor_id, position)?;
            Ok(())
        }
        ClientMessage::ToggleSharing { enabled } => {
            if conn.role != Role::Subscriber {
                return Err(GatewayError::Forbidden(
                    "only subscribers may toggle location sharing".to_string(),
                ));
            }
            engine.toggle_sharing(&conn.actor_id, enabled);
            conn.send(&ServerMessage::SharingToggled { enabled })?;
            Ok(())
        }
        ClientMessage::Ping => {
            conn.send(&ServerMessage::Pong)?;
            Ok(())
        }
    }
}
