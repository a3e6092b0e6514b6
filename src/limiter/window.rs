//! Sliding-window event counter.
//!
//! A per-key sequence of event timestamps pruned against a trailing
//! window. The engine prunes then appends on every observation, so a
//! window's length is always the count of events inside the window.

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

/// Time-ordered event log for one key.
///
/// Timestamps are appended in non-decreasing order (appends happen under
/// the engine lock).
#[derive(Debug, Clone, Default)]
pub struct SlidingWindow {
    events: Vec<DateTime<Utc>>,
}

impl SlidingWindow {
    /// Drop all events strictly older than `now - window`.
    ///
    /// An event exactly at the window boundary is retained.
    pub fn prune(&mut self, window: Duration, now: DateTime<Utc>) {
        let cutoff = cutoff(now, window);
        let keep_from = self.events.partition_point(|t| *t < cutoff);
        self.events.drain(..keep_from);
    }

    /// Append an event timestamp.
    pub fn push(&mut self, t: DateTime<Utc>) {
        self.events.push(t);
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Start of the window ending at `now`, saturating instead of panicking
/// on absurd window values.
fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let span = TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX);
    now.checked_sub_signed(span)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
