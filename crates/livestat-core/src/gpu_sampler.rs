//! Background GPU sampling.
//!
//! The GPU chain can take over a second per read (`powermetrics -i 1000`), so
//! it runs on its own thread at a fixed period. The tick thread only copies
//! [`GpuState`] out from under the lock.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;

use crate::clock::Clock;
use crate::error::ProbeResult;
use crate::sample::GpuUtilization;

/// Consecutive failed iterations after which the last values are dropped.
pub const FAILURES_BEFORE_CLEAR: u32 = 3;

/// What the sampler last observed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GpuState {
    pub utilization: Option<GpuUtilization>,
    pub updated_at_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub iterations: u64,
    pub last_error: Option<String>,
}

impl GpuState {
    /// Fold one probe outcome in. A single failure keeps the previous values.
    pub fn record(&mut self, outcome: ProbeResult<GpuUtilization>, now_ms: u64) {
        self.iterations += 1;
        match outcome.value {
            Some(gpu) => {
                self.utilization = Some(gpu);
                self.updated_at_ms = Some(now_ms);
                self.consecutive_failures = 0;
                self.last_error = None;
            }
            None => {
                self.consecutive_failures += 1;
                self.last_error = outcome.diagnostic;
                log::debug!(
                    "gpu sample failed ({} in a row): {}",
                    self.consecutive_failures,
                    self.last_error.as_deref().unwrap_or("unavailable")
                );
                if self.consecutive_failures >= FAILURES_BEFORE_CLEAR && self.utilization.is_some() {
                    log::info!("gpu readings unavailable after {FAILURES_BEFORE_CLEAR} failures");
                    self.utilization = None;
                }
            }
        }
    }
}

struct Shared {
    state: Mutex<GpuState>,
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Owns the sampling thread. Dropping the sampler stops it.
pub struct BackgroundGpuSampler {
    shared: Arc<Shared>,
    period: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundGpuSampler {
    /// Start sampling immediately, then every `period`.
    pub fn spawn<F>(probe: F, period: Duration, clock: Arc<dyn Clock>) -> Self
    where
        F: Fn() -> ProbeResult<GpuUtilization> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(GpuState::default()),
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let worker = shared.clone();
        let spawned = std::thread::Builder::new()
            .name("livestat-gpu".into())
            .spawn(move || {
                loop {
                    let outcome = catch_unwind(AssertUnwindSafe(&probe)).unwrap_or_else(|_| {
                        log::warn!("gpu probe panicked");
                        ProbeResult::unavailable("gpu probe panicked")
                    });
                    let now = clock.unix_ms();
                    worker.state.lock().unwrap().record(outcome, now);

                    let stopped = worker.stopped.lock().unwrap();
                    let (stopped, _) = worker
                        .wake
                        .wait_timeout_while(stopped, period, |s| !*s)
                        .unwrap();
                    if *stopped {
                        break;
                    }
                }
            });
        let handle = match spawned {
            Ok(h) => Some(h),
            Err(e) => {
                log::error!("failed to start gpu sampler: {e}");
                None
            }
        };
        Self {
            shared,
            period,
            handle: Mutex::new(handle),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Consistent copy of the shared state.
    pub fn snapshot(&self) -> GpuState {
        self.shared.state.lock().unwrap().clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop the loop and join the thread. Idempotent.
    pub fn stop(&self) {
        *self.shared.stopped.lock().unwrap() = true;
        self.shared.wake.notify_all();
        if let Some(h) = self.handle.lock().unwrap().take() {
            let _ = h.join();
        }
    }
}

impl Drop for BackgroundGpuSampler {
    fn drop(&mut self) {
        self.stop();
    }
}
