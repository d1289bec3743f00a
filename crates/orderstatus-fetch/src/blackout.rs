//! Scheduled blackout window.

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use orderstatus_core::BlackoutConfig;

/// Answers whether an instant falls inside the daily blackout window.
///
/// The window is evaluated in its configured zone, never the host's, so DST
/// transitions shift the UTC bounds automatically. It applies every calendar
/// day including weekends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlackoutCalendar {
    config: BlackoutConfig,
}

impl BlackoutCalendar {
    /// Creates a calendar for the given window.
    #[must_use]
    pub const fn new(config: BlackoutConfig) -> Self {
        Self { config }
    }

    /// Returns the configured window.
    #[must_use]
    pub const fn config(&self) -> &BlackoutConfig {
        &self.config
    }

    /// Returns true if `now` is inside the window.
    #[must_use]
    pub fn is_blackout(&self, now: DateTime<Utc>) -> bool {
        in_window(now, self.config.start, self.config.end, self.config.zone)
    }
}

impl Default for BlackoutCalendar {
    fn default() -> Self {
        Self::new(BlackoutConfig::default())
    }
}

/// Returns true if the local time of `now` in `zone` is in `[start, end)`.
///
/// A window with `start > end` wraps midnight. `start == end` is empty.
#[must_use]
pub fn in_window(now: DateTime<Utc>, start: NaiveTime, end: NaiveTime, zone: Tz) -> bool {
    let local = now.with_timezone(&zone).time();
    if start <= end {
        start <= local && local < end
    } else {
        local >= start || local < end
    }
}
