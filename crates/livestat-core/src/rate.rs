//! Per-second rates from cumulative counters.
//!
//! Counters only ever grow in theory; in practice they reset (interface
//! re-created, driver reload) or the clock steps. A decreasing pair yields 0 and
//! elapsed time is floored at [`MIN_ELAPSED_SECS`]. Counters read off the tick
//! thread can be handed out twice; a reading stamped no later than the baseline
//! carries no new information and repeats the previous rate.

use std::time::Instant;

use crate::sample::{CounterSnapshot, IoRates};

/// Floor applied to elapsed time before dividing.
pub const MIN_ELAPSED_SECS: f64 = 1e-6;

/// `max(now - prev, 0) / max(elapsed, MIN_ELAPSED_SECS)`.
pub fn rate_per_second(prev: u64, now: u64, elapsed_secs: f64) -> f64 {
    let elapsed = if elapsed_secs.is_finite() {
        elapsed_secs.max(MIN_ELAPSED_SECS)
    } else {
        MIN_ELAPSED_SECS
    };
    now.saturating_sub(prev) as f64 / elapsed
}

/// Rate state for one counter.
#[derive(Debug, Default, Clone)]
pub struct RateTracker {
    prev: Option<(u64, Instant)>,
    last_rate: f64,
}

impl RateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the current counter value. The first observation has no baseline and
    /// returns 0. State is replaced after the rate for this tick is computed.
    pub fn update(&mut self, value: u64, at: Instant) -> f64 {
        let rate = match self.prev {
            Some((_, prev_at)) if at <= prev_at => return self.last_rate,
            Some((prev_value, prev_at)) => {
                rate_per_second(prev_value, value, (at - prev_at).as_secs_f64())
            }
            None => 0.0,
        };
        self.prev = Some((value, at));
        self.last_rate = rate;
        rate
    }

    /// Forget the baseline, e.g. after the measured interface changed.
    pub fn reset(&mut self) {
        self.prev = None;
        self.last_rate = 0.0;
    }

    pub fn has_baseline(&self) -> bool {
        self.prev.is_some()
    }
}

/// Four independent trackers for disk and network I/O.
#[derive(Debug, Default)]
pub struct CounterRates {
    disk_read: RateTracker,
    disk_write: RateTracker,
    net_sent: RateTracker,
    net_received: RateTracker,
}

impl CounterRates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute rates for this tick. A missing counter yields a missing rate and
    /// drops that tracker's baseline, so the next reading starts fresh.
    pub fn update(&mut self, snap: &CounterSnapshot) -> IoRates {
        IoRates {
            disk_read_bps: feed(&mut self.disk_read, snap.disk_read_bytes, snap.disk_at),
            disk_write_bps: feed(&mut self.disk_write, snap.disk_written_bytes, snap.disk_at),
            net_up_bps: feed(&mut self.net_sent, snap.net_sent_bytes, snap.net_at),
            net_down_bps: feed(&mut self.net_received, snap.net_received_bytes, snap.net_at),
        }
    }

    pub fn reset_network(&mut self) {
        self.net_sent.reset();
        self.net_received.reset();
    }
}

fn feed(tracker: &mut RateTracker, value: Option<u64>, at: Instant) -> Option<f64> {
    match value {
        Some(v) => Some(tracker.update(v, at)),
        None => {
            tracker.reset();
            None
        }
    }
}
