//! Tool-backed counter reads, off the tick thread.
//!
//! Without procfs the per-tick counters come from `sysctl`, `vm_stat`, `ioreg`
//! and `netstat`. A [`ToolPoller`] runs those on its own thread. The tick asks
//! for a counter (which marks it wanted), takes whatever reading the worker
//! finished last, and kicks the worker once it is done. Kicks that arrive while
//! a round is running fold into one follow-up round.
//!
//! The thread is only started by the first kick after some counter was wanted,
//! so hosts where procfs answers everything never spawn it.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use super::{CounterChains, CpuReading, DiskIo, resolved};
use crate::clock::Clock;
use crate::error::ProbeError;
use crate::sample::{InterfaceCounters, MemoryUsage};

/// A reading taken by the worker and the moment it completed.
#[derive(Debug, Clone, PartialEq)]
pub struct Polled<T> {
    pub value: Result<T, ProbeError>,
    pub at: Instant,
}

struct Slot<T> {
    wanted: bool,
    latest: Option<Polled<T>>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            wanted: false,
            latest: None,
        }
    }
}

impl<T: Clone> Slot<T> {
    fn request(&mut self) -> Result<Polled<T>, ProbeError> {
        self.wanted = true;
        self.latest
            .clone()
            .ok_or_else(|| ProbeError::unavailable("waiting for the first tool poll"))
    }
}

#[derive(Default)]
struct PollState {
    cpu: Slot<CpuReading>,
    memory: Slot<MemoryUsage>,
    disk_io: Slot<DiskIo>,
    interfaces: Slot<Vec<InterfaceCounters>>,
    pending: bool,
    stopped: bool,
    rounds: u64,
}

impl PollState {
    fn any_wanted(&self) -> bool {
        self.cpu.wanted || self.memory.wanted || self.disk_io.wanted || self.interfaces.wanted
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<PollState>,
    wake: Condvar,
}

/// Owns the tool worker. Dropping the poller stops it.
pub struct ToolPoller {
    shared: Arc<Shared>,
    chains: Arc<CounterChains>,
    clock: Arc<dyn Clock>,
    handle: Option<JoinHandle<()>>,
}

impl ToolPoller {
    pub fn new(chains: Arc<CounterChains>, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            chains,
            clock,
            handle: None,
        }
    }

    pub fn cpu(&mut self) -> Result<Polled<CpuReading>, ProbeError> {
        self.shared.state.lock().unwrap().cpu.request()
    }

    pub fn memory(&mut self) -> Result<Polled<MemoryUsage>, ProbeError> {
        self.shared.state.lock().unwrap().memory.request()
    }

    pub fn disk_io(&mut self) -> Result<Polled<DiskIo>, ProbeError> {
        self.shared.state.lock().unwrap().disk_io.request()
    }

    pub fn interfaces(&mut self) -> Result<Polled<Vec<InterfaceCounters>>, ProbeError> {
        self.shared.state.lock().unwrap().interfaces.request()
    }

    /// Ask for a round over every wanted counter. Never waits for it.
    pub fn kick(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if !state.any_wanted() {
                return;
            }
            state.pending = true;
        }
        if self.handle.is_none() {
            self.handle = self.spawn();
        }
        self.shared.wake.notify_all();
    }

    /// Completed rounds so far.
    pub fn rounds(&self) -> u64 {
        self.shared.state.lock().unwrap().rounds
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn spawn(&self) -> Option<JoinHandle<()>> {
        let shared = self.shared.clone();
        let chains = self.chains.clone();
        let clock = self.clock.clone();
        let spawned = std::thread::Builder::new()
            .name("livestat-tools".into())
            .spawn(move || run(&shared, &chains, clock.as_ref()));
        match spawned {
            Ok(h) => {
                log::debug!("tool counter poller started");
                Some(h)
            }
            Err(e) => {
                log::error!("failed to start tool counter poller: {e}");
                None
            }
        }
    }

    /// Stop the worker and join it. Idempotent.
    pub fn stop(&mut self) {
        self.shared.state.lock().unwrap().stopped = true;
        self.shared.wake.notify_all();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for ToolPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Which counters one round covers.
#[derive(Clone, Copy)]
struct Wanted {
    cpu: bool,
    memory: bool,
    disk_io: bool,
    interfaces: bool,
}

fn run(shared: &Shared, chains: &CounterChains, clock: &dyn Clock) {
    loop {
        let wanted = {
            let state = shared.state.lock().unwrap();
            let mut state = shared
                .wake
                .wait_while(state, |s| !s.pending && !s.stopped)
                .unwrap();
            if state.stopped {
                break;
            }
            state.pending = false;
            Wanted {
                cpu: state.cpu.wanted,
                memory: state.memory.wanted,
                disk_io: state.disk_io.wanted,
                interfaces: state.interfaces.wanted,
            }
        };

        // each reading is published as soon as it completes
        if wanted.cpu {
            let value = resolved(chains.cpu.tools.resolve());
            let at = clock.now();
            shared.state.lock().unwrap().cpu.latest = Some(Polled { value, at });
        }
        if wanted.memory {
            let value = resolved(chains.memory.tools.resolve());
            let at = clock.now();
            shared.state.lock().unwrap().memory.latest = Some(Polled { value, at });
        }
        if wanted.disk_io {
            let value = resolved(chains.disk_io.tools.resolve());
            let at = clock.now();
            shared.state.lock().unwrap().disk_io.latest = Some(Polled { value, at });
        }
        if wanted.interfaces {
            let value = resolved(chains.interfaces.tools.resolve()).map(|i| i.0);
            let at = clock.now();
            shared.state.lock().unwrap().interfaces.latest = Some(Polled { value, at });
        }
        shared.state.lock().unwrap().rounds += 1;
    }
    log::debug!("tool counter poller stopped");
}
