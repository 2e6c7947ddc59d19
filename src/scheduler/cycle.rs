//! Hourly cycle boundary tracking.

use chrono::{DateTime, Utc};

use crate::clock::hour_key;

/// Remembers the hour the current cycle started in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleClock {
    hour: i64,
}

impl CycleClock {
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self { hour: hour_key(now) }
    }

    /// Whether `now` falls in a different hour than the cycle start.
    pub fn crossed(&self, now: DateTime<Utc>) -> bool {
        hour_key(now) != self.hour
    }

    /// Arm the clock for a cycle starting at `now`.
    pub fn rearm(&mut self, now: DateTime<Utc>) {
        self.hour = hour_key(now);
    }
}
