//! Opt-in gate for subscriber location sharing.
//!
//! This is the only entry point for subscriber position data. The
//! proximity engine reads subscriber positions exclusively through
//! [`PrivacyGate::position`], so an actor who never opted in (or who
//! opted out) cannot leak into an evaluation. Opt-out destroys the
//! stored state immediately; nothing is retained.

use crate::error::{Result, TrackerError};
use crate::types::{now_ms, Position, SubscriberState};
use dashmap::DashMap;
use metrics::gauge;
use tracing::{debug, info};

pub struct PrivacyGate {
    subscribers: DashMap<String, SubscriberState>,
}

impl PrivacyGate {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
        }
    }

    /// Enable location sharing for an actor. Idempotent.
    pub fn enable_sharing(&self, actor_id: &str) {
        self.subscribers
            .entry(actor_id.to_string())
            .or_insert_with(|| SubscriberState {
                actor_id: actor_id.to_string(),
                position: None,
                updated_at: now_ms(),
                sharing_enabled: true,
            });
        gauge!("tracker_sharing_subscribers").set(self.subscribers.len() as f64);
        info!("Location sharing enabled for {}", actor_id);
    }

    /// Disable sharing and destroy stored state. Idempotent.
    pub fn disable_sharing(&self, actor_id: &str) {
        if self.subscribers.remove(actor_id).is_some() {
            info!("Location sharing disabled for {}", actor_id);
        }
        gauge!("tracker_sharing_subscribers").set(self.subscribers.len() as f64);
    }

    /// Record a subscriber position. Fails with `SharingDisabled` when
    /// the actor has not opted in; no state is created by a rejected
    /// update.
    pub fn update_position(&self, actor_id: &str, position: Position) -> Result<()> {
        if !position.is_valid() {
            return Err(TrackerError::InvalidReport(
                "subscriber position must have finite coordinates".to_string(),
            ));
        }
        let mut entry = self
            .subscribers
            .get_mut(actor_id)
            .ok_or_else(|| TrackerError::SharingDisabled(actor_id.to_string()))?;
        entry.position = Some(position);
        entry.updated_at = now_ms();
        debug!("Updated shared position for {}", actor_id);
        Ok(())
    }

    /// Position of an opted-in actor. None when the actor is not
    /// sharing or has not reported a position yet.
    pub fn position(&self, actor_id: &str) -> Option<Position> {
        self.subscribers.get(actor_id).and_then(|s| s.position)
    }

    pub fn is_sharing(&self, actor_id: &str) -> bool {
        self.subscribers.contains_key(actor_id)
    }

    pub fn sharing_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for PrivacyGate {
    fn default() -> Self {
        Self::new()
    }
}
