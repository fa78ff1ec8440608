//! Gateway service for real-time transit tracking over WebSocket.
//!
//! This service:
//! - Accepts WebSocket connections from drivers, subscribers, and staff
//! - Manages room membership for vehicle, route, and fleet-wide topics
//! - Feeds vehicle position reports into the tracking engine
//! - Streams location broadcasts and proximity alerts back to clients
//!
//! ## Architecture
//!
//! ```text
//! WebSocket clients
//!         ↓ reports / room joins
//! Session layer (this crate)
//!         ↓
//! tracker::Engine (ingest → rooms → proximity → notify)
//!         ↓
//! WebSocket clients
//! ```
//!
//! The identity layer terminates authentication upstream and forwards
//! the actor identity on the upgrade request; payments, fleet CRUD,
//! and persistence live in their own services.

pub mod error;
pub mod ws_server;

pub use error::{GatewayError, Result};
pub use ws_server::{create_router, AppState, ConnectParams};
