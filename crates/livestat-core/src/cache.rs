//! TTL cache with single-flight around one expensive, fallible probe.
//!
//! Successes and failures are stored alike and share the same TTL, so a probe
//! that keeps failing is retried at most once per TTL. While a probe runs for a
//! key, other callers for that key block on a condvar and receive the result of
//! that one execution instead of starting their own.

use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::error::ProbeResult;

type ProbeFn<K, T> = dyn Fn(&K) -> ProbeResult<T> + Send + Sync;

/// A stored probe outcome.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub result: ProbeResult<T>,
    pub captured_at: Instant,
    pub ttl: Duration,
}

impl<T> CacheEntry<T> {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.captured_at)
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        self.age(now) < self.ttl
    }
}

struct Slot<T> {
    entry: Option<CacheEntry<T>>,
    in_flight: bool,
    /// Bumped every time a flight completes.
    generation: u64,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            entry: None,
            in_flight: false,
            generation: 0,
        }
    }
}

struct Slots<K, T> {
    by_key: HashMap<K, Slot<T>>,
    /// Bumped by invalidation; a flight that started under an older epoch stores
    /// its result already expired.
    epoch: u64,
}

/// Keyed TTL cache in front of a probe function.
pub struct CachedProbe<K, T> {
    name: String,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    probe: Box<ProbeFn<K, T>>,
    slots: Mutex<Slots<K, T>>,
    done: Condvar,
}

impl<K, T> CachedProbe<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    pub fn new<F>(name: impl Into<String>, ttl: Duration, clock: Arc<dyn Clock>, probe: F) -> Self
    where
        F: Fn(&K) -> ProbeResult<T> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            ttl,
            clock,
            probe: Box::new(probe),
            slots: Mutex::new(Slots {
                by_key: HashMap::new(),
                epoch: 0,
            }),
            done: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the cached result for `key` if it is younger than the TTL,
    /// otherwise run the probe (once, however many callers are waiting).
    pub fn get(&self, key: &K) -> ProbeResult<T> {
        let mut slots = self.slots.lock().unwrap();
        loop {
            let now = self.clock.now();
            let slot = slots.by_key.entry(key.clone()).or_default();
            if let Some(entry) = &slot.entry
                && entry.is_fresh(now)
            {
                return entry.result.clone();
            }
            if !slot.in_flight {
                slot.in_flight = true;
                break;
            }

            let waiting_on = slot.generation;
            slots = self
                .done
                .wait_while(slots, |s| {
                    s.by_key
                        .get(key)
                        .is_some_and(|sl| sl.in_flight && sl.generation == waiting_on)
                })
                .unwrap();
            if let Some(slot) = slots.by_key.get(key)
                && slot.generation != waiting_on
                && let Some(entry) = &slot.entry
            {
                return entry.result.clone();
            }
        }
        let started_epoch = slots.epoch;
        drop(slots);

        let result = match catch_unwind(AssertUnwindSafe(|| (self.probe)(key))) {
            Ok(result) => result,
            Err(_) => {
                log::warn!("{}: probe panicked", self.name);
                ProbeResult::unavailable(format!("{} panicked", self.name))
            }
        };

        let mut slots = self.slots.lock().unwrap();
        let ttl = if slots.epoch == started_epoch {
            self.ttl
        } else {
            Duration::ZERO
        };
        let slot = slots.by_key.entry(key.clone()).or_default();
        slot.entry = Some(CacheEntry {
            result: result.clone(),
            captured_at: self.clock.now(),
            ttl,
        });
        slot.in_flight = false;
        slot.generation += 1;
        drop(slots);
        self.done.notify_all();
        result
    }

    /// Whatever is stored for `key`, fresh or not, without probing.
    pub fn peek(&self, key: &K) -> Option<CacheEntry<T>> {
        let slots = self.slots.lock().unwrap();
        slots.by_key.get(key).and_then(|s| s.entry.clone())
    }

    /// Drop the entry for `key`; the next `get` probes again.
    pub fn invalidate(&self, key: &K) {
        let mut slots = self.slots.lock().unwrap();
        slots.epoch += 1;
        if let Some(slot) = slots.by_key.get_mut(key) {
            slot.entry = None;
        }
    }

    pub fn invalidate_all(&self) {
        let mut slots = self.slots.lock().unwrap();
        slots.epoch += 1;
        for slot in slots.by_key.values_mut() {
            slot.entry = None;
        }
    }
}

impl<T: Clone> CachedProbe<(), T> {
    /// Convenience for probes with a single implicit key.
    pub fn get_one(&self) -> ProbeResult<T> {
        self.get(&())
    }
}

/// Type-erased handle so unrelated caches can be invalidated together.
pub trait Invalidate: Send + Sync {
    fn invalidate_all(&self);
}

impl<K, T> Invalidate for CachedProbe<K, T>
where
    K: Eq + Hash + Clone + Send,
    T: Clone + Send,
{
    fn invalidate_all(&self) {
        CachedProbe::invalidate_all(self);
    }
}
