//! Wall-clock and logical-clock helpers.
//!
//! Lifecycle events carry two notions of time: a unix timestamp (float
//! seconds) for humans, and a Lamport clock that orders one task's events
//! independently of when they arrive.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

/// Current wall-clock time as float unix seconds.
pub fn now() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

/// Convert float unix seconds to a UTC datetime.
///
/// Returns `None` for values chrono cannot represent (NaN, out of range).
pub fn to_datetime(timestamp: f64) -> Option<DateTime<Utc>> {
    if !timestamp.is_finite() {
        return None;
    }
    let secs = timestamp.floor();
    let nanos = ((timestamp - secs) * 1_000_000_000.0).round() as u32;
    DateTime::from_timestamp(secs as i64, nanos.min(999_999_999))
}

/// Render an optional timestamp for console output.
pub fn display(timestamp: Option<f64>) -> String {
    match timestamp.and_then(to_datetime) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        None => "None".to_string(),
    }
}

/// Lamport clock shared by everything that emits events from one process.
#[derive(Debug, Default)]
pub struct LamportClock {
    value: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock and return the new value.
    pub fn tick(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Merge a clock value seen on an incoming message.
    ///
    /// The next `tick` is then strictly greater than `seen`.
    pub fn observe(&self, seen: u64) {
        self.value.fetch_max(seen, Ordering::SeqCst);
    }

    pub fn current(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}
