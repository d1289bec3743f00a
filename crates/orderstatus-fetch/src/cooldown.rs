//! Per-instance cooldown after an observed upstream failure.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use orderstatus_core::Instance;
use tracing::debug;

/// Tracks the last failure per instance and suppresses live calls for a
/// fixed period afterwards.
///
/// Cooldown is active while `now - failed_at < duration`. A success clears it
/// immediately.
#[derive(Debug)]
pub struct CooldownTracker {
    failed_at: RwLock<HashMap<Instance, DateTime<Utc>>>,
    duration: chrono::Duration,
}

impl CooldownTracker {
    /// Creates a tracker with the given cooldown length.
    #[must_use]
    pub fn new(duration: std::time::Duration) -> Self {
        Self {
            failed_at: RwLock::new(HashMap::new()),
            duration: chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Returns the cooldown length.
    #[must_use]
    pub const fn duration(&self) -> chrono::Duration {
        self.duration
    }

    /// Returns true if `instance` is still cooling down at `now`.
    pub fn is_cooling_down(&self, instance: &Instance, now: DateTime<Utc>) -> bool {
        self.cooling_until(instance).is_some_and(|until| now < until)
    }

    /// Records a failure observed at `now`.
    pub fn mark_failure(&self, instance: &Instance, now: DateTime<Utc>) {
        debug!(instance = %instance, "Starting cooldown");
        self.failed_at
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instance.clone(), now);
    }

    /// Ends any cooldown for `instance`.
    pub fn clear(&self, instance: &Instance) {
        let removed = self
            .failed_at
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance);
        if removed.is_some() {
            debug!(instance = %instance, "Cooldown cleared");
        }
    }

    /// When the last recorded failure's cooldown ends, if one was recorded.
    ///
    /// The returned instant may already be in the past.
    pub fn cooling_until(&self, instance: &Instance) -> Option<DateTime<Utc>> {
        let failed_at = *self
            .failed_at
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance)?;
        Some(
            failed_at
                .checked_add_signed(self.duration)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }
}
