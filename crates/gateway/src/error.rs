//! Gateway error types.

use thiserror::Error;
use tracker::TrackerError;

/// Session-layer error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Engine-level failure (validation, lookup, privacy, delivery).
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    /// Malformed inbound JSON frame.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Message kind not permitted for the connection's role.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The connection's outbound channel is full or closed.
    #[error("channel send error")]
    ChannelSend,
}

impl GatewayError {
    /// Stable machine-readable code sent in error acks.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Tracker(e) => match e {
                TrackerError::InvalidReport(_) => "INVALID_REPORT",
                TrackerError::StaleReport => "STALE_REPORT",
                TrackerError::NotFound(_) => "NOT_FOUND",
                TrackerError::SharingDisabled(_) => "SHARING_DISABLED",
                TrackerError::DuplicateConnection(_) => "DUPLICATE_CONNECTION",
                TrackerError::DeliveryFailure(_) => "DELIVERY_FAILURE",
                TrackerError::Json(_) => "MALFORMED_MESSAGE",
                TrackerError::Store(_) => "INTERNAL",
            },
            Self::Json(_) => "MALFORMED_MESSAGE",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::ChannelSend => "DELIVERY_FAILURE",
        }
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
