//! The periodic sampling tick and its watchdog.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::config::clamp_interval_ms;

/// A clock whose last tick is older than `STALL_FACTOR × interval + STALL_GRACE`
/// counts as stalled. Age is measured on both the monotonic and the wall clock:
/// the monotonic one can stand still while the host sleeps.
const STALL_FACTOR: u32 = 3;
const STALL_GRACE: Duration = Duration::from_secs(5);

struct Control {
    running: bool,
    /// Bumped on every (re)start; a tick thread exits once its generation is stale.
    generation: u64,
}

/// When the last tick finished.
#[derive(Clone, Copy)]
struct Heartbeat {
    at: Instant,
    unix_ms: u64,
}

struct Inner {
    interval_ms: AtomicU64,
    control: Mutex<Control>,
    wake: Condvar,
    heartbeat: Mutex<Option<Heartbeat>>,
    ticks: AtomicU64,
    restarts: AtomicU64,
    clock: Arc<dyn Clock>,
    tick: Box<dyn Fn() + Send + Sync>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Runs `tick` once immediately and then every interval on a dedicated thread.
///
/// Interval changes take effect from the next sleep; a tick in progress is
/// never interrupted. Cloning shares the same clock.
#[derive(Clone)]
pub struct SampleClock {
    inner: Arc<Inner>,
}

impl SampleClock {
    pub fn new<F>(tick: F, interval_ms: u64, clock: Arc<dyn Clock>) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                interval_ms: AtomicU64::new(clamp_interval_ms(interval_ms)),
                control: Mutex::new(Control {
                    running: false,
                    generation: 0,
                }),
                wake: Condvar::new(),
                heartbeat: Mutex::new(None),
                ticks: AtomicU64::new(0),
                restarts: AtomicU64::new(0),
                clock,
                tick: Box::new(tick),
                handle: Mutex::new(None),
            }),
        }
    }

    pub fn interval_ms(&self) -> u64 {
        self.inner.interval_ms.load(Ordering::SeqCst)
    }

    /// Clamp and store a new interval. Returns the value actually applied.
    pub fn set_interval(&self, interval_ms: u64) -> u64 {
        let ms = clamp_interval_ms(interval_ms);
        let prev = self.inner.interval_ms.swap(ms, Ordering::SeqCst);
        if prev != ms {
            log::debug!("sampling interval {prev}ms -> {ms}ms");
        }
        ms
    }

    /// Completed ticks since creation.
    pub fn ticks(&self) -> u64 {
        self.inner.ticks.load(Ordering::SeqCst)
    }

    /// Restarts performed by [`restart`](Self::restart).
    pub fn restarts(&self) -> u64 {
        self.inner.restarts.load(Ordering::SeqCst)
    }

    /// Start ticking unless already running.
    pub fn start(&self) {
        if self.is_running() {
            return;
        }
        self.launch();
    }

    /// Abandon the current tick thread, if any, and start a fresh one at
    /// `interval_ms`. A thread stuck inside a tick is left to exit on its own.
    pub fn restart(&self, interval_ms: u64) {
        let ms = self.set_interval(interval_ms);
        self.inner.restarts.fetch_add(1, Ordering::SeqCst);
        log::info!("restarting sample clock at {ms}ms");
        self.launch();
    }

    fn launch(&self) {
        let generation = {
            let mut c = self.inner.control.lock().unwrap();
            c.generation += 1;
            c.running = true;
            c.generation
        };
        self.inner.wake.notify_all();
        self.inner.beat();

        let inner = self.inner.clone();
        let spawned = std::thread::Builder::new()
            .name("livestat-tick".into())
            .spawn(move || run(inner, generation));
        match spawned {
            Ok(h) => *self.inner.handle.lock().unwrap() = Some(h),
            Err(e) => {
                log::error!("failed to start sample clock: {e}");
                self.inner.control.lock().unwrap().running = false;
            }
        }
    }

    /// Stop ticking and join the tick thread, unless called from it.
    pub fn stop(&self) {
        self.inner.control.lock().unwrap().running = false;
        self.inner.wake.notify_all();
        let handle = self.inner.handle.lock().unwrap().take();
        if let Some(h) = handle
            && h.thread().id() != std::thread::current().id()
        {
            let _ = h.join();
        }
    }

    fn is_running(&self) -> bool {
        self.inner.control.lock().unwrap().running
            && self
                .inner
                .handle
                .lock()
                .unwrap()
                .as_ref()
                .is_some_and(|h| !h.is_finished())
    }

    /// Running, thread alive, and ticked recently enough.
    pub fn is_active(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let interval = Duration::from_millis(self.interval_ms());
        let limit = interval * STALL_FACTOR + STALL_GRACE;
        let Some(hb) = *self.inner.heartbeat.lock().unwrap() else {
            return true;
        };
        let mono = self.inner.clock.now().saturating_duration_since(hb.at);
        let wall = Duration::from_millis(self.inner.clock.unix_ms().saturating_sub(hb.unix_ms));
        mono <= limit && wall <= limit
    }
}

impl Inner {
    fn beat(&self) {
        let hb = Heartbeat {
            at: self.clock.now(),
            unix_ms: self.clock.unix_ms(),
        };
        *self.heartbeat.lock().unwrap() = Some(hb);
    }
}

fn run(inner: Arc<Inner>, generation: u64) {
    let current = |c: &Control| c.running && c.generation == generation;
    loop {
        if !current(&inner.control.lock().unwrap()) {
            break;
        }
        if catch_unwind(AssertUnwindSafe(|| (inner.tick)())).is_err() {
            log::error!("sample tick panicked");
        }
        inner.ticks.fetch_add(1, Ordering::SeqCst);
        inner.beat();

        let interval = Duration::from_millis(inner.interval_ms.load(Ordering::SeqCst));
        let control = inner.control.lock().unwrap();
        let (control, _) = inner
            .wake
            .wait_timeout_while(control, interval, |c| current(&*c))
            .unwrap();
        if !current(&control) {
            break;
        }
    }
}

/// Periodically checks a [`SampleClock`] and restarts it when inactive, for
/// example after the host slept with the tick thread suspended.
pub struct Watchdog {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    /// One watchdog pass. Returns whether a restart happened.
    pub fn check(clock: &SampleClock, restart_interval_ms: u64) -> bool {
        if clock.is_active() {
            return false;
        }
        clock.restart(restart_interval_ms);
        true
    }

    pub fn spawn(clock: SampleClock, period: Duration, restart_interval_ms: u64) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let flag = stop.clone();
        let spawned = std::thread::Builder::new()
            .name("livestat-watchdog".into())
            .spawn(move || {
                let (lock, cvar) = &*flag;
                loop {
                    let stopped = lock.lock().unwrap();
                    let (stopped, _) = cvar.wait_timeout_while(stopped, period, |s| !*s).unwrap();
                    if *stopped {
                        break;
                    }
                    drop(stopped);
                    Watchdog::check(&clock, restart_interval_ms);
                }
            });
        let handle = match spawned {
            Ok(h) => Some(h),
            Err(e) => {
                log::error!("failed to start watchdog: {e}");
                None
            }
        };
        Self {
            stop,
            handle: Mutex::new(handle),
        }
    }

    pub fn stop(&self) {
        let (lock, cvar) = &*self.stop;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
        if let Some(h) = self.handle.lock().unwrap().take() {
            let _ = h.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
