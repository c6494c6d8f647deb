//! Shared signing epoch

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between the Unix epoch and 2015-01-01 00:00:00 UTC
const SIGNING_ORIGIN_UNIX_SECS: u64 = 1_420_070_400;

/// Signing timestamps count in units of 10 microseconds
const TICKS_PER_SECOND: u128 = 100_000;

/// Signing epoch derived from a wall-clock time, zero before the origin
pub fn epoch_at(wall: SystemTime) -> u64 {
    let origin = UNIX_EPOCH + Duration::from_secs(SIGNING_ORIGIN_UNIX_SECS);
    let since = wall.duration_since(origin).unwrap_or_default();
    let ticks = since.as_nanos() * TICKS_PER_SECOND / 1_000_000_000;
    u64::try_from(ticks).unwrap_or(u64::MAX)
}

/// Monotonic counter shared by every network's signer.
///
/// Only the dispatch core advances it; routers receive copies.
#[derive(Debug, Default)]
pub struct SigningClock {
    current: AtomicU64,
}

impl SigningClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance to the epoch of `wall`, or by one if the wall clock did not
    /// move forward
    pub fn advance(&self, wall: SystemTime) -> u64 {
        let wall = epoch_at(wall);
        let mut next = wall;
        // The closure always returns `Some`, so the update cannot fail
        let _ = self
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                next = wall.max(current.saturating_add(1));
                Some(next)
            });
        next
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }
}
