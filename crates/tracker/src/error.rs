//! Tracker error types.

use thiserror::Error;

/// Error type for all engine operations.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Malformed position report (missing or non-finite fields).
    #[error("invalid report: {0}")]
    InvalidReport(String),

    /// Report older than the currently stored vehicle state.
    #[error("stale report: timestamp older than stored state")]
    StaleReport,

    /// Operation on an unknown connection, room, or vehicle.
    #[error("not found: {0}")]
    NotFound(String),

    /// Subscriber position rejected because sharing is not enabled.
    #[error("location sharing disabled for actor {0}")]
    SharingDisabled(String),

    /// A connection with this identifier is already registered.
    #[error("duplicate connection: {0}")]
    DuplicateConnection(String),

    /// A member's outbound channel was closed or full during delivery.
    #[error("delivery failure: {0}")]
    DeliveryFailure(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Notification persistence error.
    #[error("store error: {0}")]
    Store(String),
}

impl From<redis::RedisError> for TrackerError {
    fn from(e: redis::RedisError) -> Self {
        TrackerError::Store(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, TrackerError>;
