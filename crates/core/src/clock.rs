use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock timestamps in milliseconds since the Unix epoch.
///
/// History merging and offline-queue bookkeeping read time through this
/// trait so tests can drive it by hand.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        physical_now()
    }
}

/// Returns the current wall-clock time as milliseconds since Unix epoch.
/// A clock set before the epoch reads as zero.
pub fn physical_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
