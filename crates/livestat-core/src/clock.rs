//! Time sources for the engine.
//!
//! Every component that reasons about age or elapsed time takes an
//! `Arc<dyn Clock>` instead of calling `Instant::now()` directly, so caches and
//! rate trackers can be driven deterministically in tests.

use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Monotonic plus wall-clock time.
pub trait Clock: Send + Sync {
    /// Monotonic instant used for ages, TTLs and elapsed time.
    fn now(&self) -> Instant;

    /// Wall-clock milliseconds since the Unix epoch, used for sample timestamps.
    fn unix_ms(&self) -> u64;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_ms(&self) -> u64 {
        unix_ms_now()
    }
}

pub(crate) fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A clock that only moves when told to.
///
/// Both readings advance together: `unix_ms` starts at the epoch offset given to
/// [`ManualClock::starting_at`] and tracks the same offset as `now`.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    base_unix_ms: u64,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(1_700_000_000_000)
    }

    pub fn starting_at(unix_ms: u64) -> Self {
        Self {
            base: Instant::now(),
            base_unix_ms: unix_ms,
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap();
        *offset += by;
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn unix_ms(&self) -> u64 {
        self.base_unix_ms + self.elapsed().as_millis() as u64
    }
}
