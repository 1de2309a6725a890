//! Acquisition strategies for every metric.
//!
//! Each submodule builds [`SourceResolver`](crate::resolver::SourceResolver)
//! chains out of procfs/sysfs reads and external tools. Procfs strategies come
//! first: they fail instantly where the files do not exist, so one chain serves
//! both Linux and macOS without per-platform builds.
//!
//! The per-tick counter chains are [`SplitChain`]s. Their procfs half runs on
//! the tick thread; their tool half runs on a [`ToolPoller`] worker, and the
//! tick only reads what the worker last finished. [`HostCounters`] combines the
//! two behind [`CounterSource`].

pub mod cpu;
pub mod disk;
pub mod gpu;
pub mod memory;
pub mod network;
pub mod poller;
pub mod processes;
pub mod sensors;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};
use crate::command::{CommandRunner, CommandSpec};
use crate::error::{ProbeError, ProbeResult};
use crate::resolver::{Resolution, SourceResolver, Validate};
use crate::sample::{InterfaceCounters, MemoryUsage};

pub use cpu::CpuReading;
pub use disk::DiskIo;
pub use poller::{Polled, ToolPoller};

/// Bound for each tool call behind a per-tick counter.
pub const COUNTER_COMMAND_TIMEOUT: Duration = Duration::from_millis(180);

/// Where procfs and sysfs live. Tests point these at a temp directory.
#[derive(Debug, Clone)]
pub struct SysPaths {
    pub proc_root: PathBuf,
    pub sys_root: PathBuf,
}

impl Default for SysPaths {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            sys_root: PathBuf::from("/sys"),
        }
    }
}

impl SysPaths {
    pub fn under(root: &Path) -> Self {
        Self {
            proc_root: root.join("proc"),
            sys_root: root.join("sys"),
        }
    }
}

/// Read a procfs/sysfs file as a probe step.
pub(crate) fn read_file(path: &Path) -> Result<String, ProbeError> {
    std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ProbeError::unavailable(format!("{} missing", path.display())),
        _ => ProbeError::crashed(path.display().to_string(), e.to_string()),
    })
}

/// Run a tool and require non-empty stdout.
pub(crate) fn tool(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, ProbeError> {
    let spec = CommandSpec::new(program)
        .args(args.iter().copied())
        .timeout(timeout);
    runner.stdout(&spec)
}

pub(crate) fn parsed<T>(what: &str, value: Option<T>) -> Result<T, ProbeError> {
    value.ok_or_else(|| ProbeError::unavailable(format!("unrecognized {what} output")))
}

fn resolved<T>(r: Resolution<T>) -> Result<T, ProbeError> {
    match r.value {
        Some(v) => Ok(v),
        None => Err(ProbeError::unavailable(r.summary())),
    }
}

// ---------------------------------------------------------------------------
// Counter chains
// ---------------------------------------------------------------------------

/// One counter chain cut where its strategies start running subprocesses.
pub struct SplitChain<T> {
    /// File reads only. Safe on the tick thread.
    pub inline: SourceResolver<T>,
    /// Tool-backed fallbacks, run off the tick thread.
    pub tools: SourceResolver<T>,
}

impl<T: Validate> SplitChain<T> {
    /// Both halves in order, as one chain with one attempt trail.
    pub fn resolve(&self) -> Resolution<T> {
        self.inline.resolve().or_else(|| self.tools.resolve())
    }

    pub fn probe(&self) -> ProbeResult<T> {
        self.resolve().into_probe_result()
    }
}

/// Every per-tick counter chain. Shared between the tick, the tool poller and
/// introspection.
pub struct CounterChains {
    pub cpu: SplitChain<CpuReading>,
    pub memory: SplitChain<MemoryUsage>,
    pub disk_io: SplitChain<DiskIo>,
    pub interfaces: SplitChain<network::Interfaces>,
}

impl CounterChains {
    pub fn new(runner: Arc<dyn CommandRunner>, paths: &SysPaths) -> Self {
        Self {
            cpu: cpu::resolver(paths, runner.clone()),
            memory: memory::resolver(paths, runner.clone()),
            disk_io: disk::io_resolver(paths, runner.clone()),
            interfaces: network::resolver(paths, runner),
        }
    }

    /// Resolve one chain by metric name, uncached, with the full attempt trail.
    pub fn explain(&self, metric: &str) -> Option<Resolution<String>> {
        match metric {
            "cpu" => Some(self.cpu.resolve().describe()),
            "memory" | "ram" => Some(self.memory.resolve().describe()),
            "disk_io" => Some(self.disk_io.resolve().describe()),
            "net" | "network" => Some(self.interfaces.resolve().describe()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tick-facing source
// ---------------------------------------------------------------------------

/// The two I/O counters whose rates depend on when they were read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCounter {
    Disk,
    Network,
}

/// Cumulative OS counters polled once per tick. Implementations must not block
/// on subprocesses.
pub trait CounterSource: Send {
    fn cpu(&mut self) -> Result<CpuReading, ProbeError>;
    fn memory(&mut self) -> Result<MemoryUsage, ProbeError>;
    fn disk_io(&mut self) -> Result<DiskIo, ProbeError>;
    fn interfaces(&mut self) -> Result<Vec<InterfaceCounters>, ProbeError>;

    /// When the counter last returned was actually read, if that was before
    /// the call that returned it.
    fn read_at(&self, _counter: IoCounter) -> Option<Instant> {
        None
    }

    /// Called once per tick after every counter was read.
    fn after_tick(&mut self) {}

    /// The chains behind this source, for introspection off the tick thread.
    fn chains(&self) -> Option<Arc<CounterChains>> {
        None
    }
}

/// Procfs inline, tools through a [`ToolPoller`].
pub struct HostCounters {
    chains: Arc<CounterChains>,
    poller: ToolPoller,
    disk_at: Option<Instant>,
    net_at: Option<Instant>,
}

impl HostCounters {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_paths(runner, SysPaths::default())
    }

    pub fn with_paths(runner: Arc<dyn CommandRunner>, paths: SysPaths) -> Self {
        Self::with_clock(runner, paths, Arc::new(SystemClock))
    }

    /// `clock` stamps tool-backed readings; give it the engine's clock.
    pub fn with_clock(runner: Arc<dyn CommandRunner>, paths: SysPaths, clock: Arc<dyn Clock>) -> Self {
        let chains = Arc::new(CounterChains::new(runner, &paths));
        Self {
            poller: ToolPoller::new(chains.clone(), clock),
            chains,
            disk_at: None,
            net_at: None,
        }
    }

    pub fn poller(&self) -> &ToolPoller {
        &self.poller
    }
}

/// The inline half's value, else the poller's latest reading with its stamp.
fn inline_or_polled<T, U>(
    chain: &SplitChain<T>,
    polled: impl FnOnce() -> Result<Polled<U>, ProbeError>,
    convert: impl FnOnce(T) -> U,
) -> Result<(U, Option<Instant>), ProbeError>
where
    T: Validate,
{
    let mut inline = chain.inline.resolve();
    if let Some(v) = inline.value.take() {
        return Ok((convert(v), None));
    }
    match polled() {
        Ok(p) => p.value.map(|v| (v, Some(p.at))),
        Err(e) => Err(ProbeError::unavailable(format!("{}; {e}", inline.summary()))),
    }
}

impl CounterSource for HostCounters {
    fn cpu(&mut self) -> Result<CpuReading, ProbeError> {
        let poller = &mut self.poller;
        inline_or_polled(&self.chains.cpu, || poller.cpu(), |v| v).map(|(v, _)| v)
    }

    fn memory(&mut self) -> Result<MemoryUsage, ProbeError> {
        let poller = &mut self.poller;
        inline_or_polled(&self.chains.memory, || poller.memory(), |v| v).map(|(v, _)| v)
    }

    fn disk_io(&mut self) -> Result<DiskIo, ProbeError> {
        let poller = &mut self.poller;
        let (io, at) = inline_or_polled(&self.chains.disk_io, || poller.disk_io(), |v| v)?;
        self.disk_at = at;
        Ok(io)
    }

    fn interfaces(&mut self) -> Result<Vec<InterfaceCounters>, ProbeError> {
        let poller = &mut self.poller;
        let (list, at) = inline_or_polled(&self.chains.interfaces, || poller.interfaces(), |i| i.0)?;
        self.net_at = at;
        Ok(list)
    }

    fn read_at(&self, counter: IoCounter) -> Option<Instant> {
        match counter {
            IoCounter::Disk => self.disk_at,
            IoCounter::Network => self.net_at,
        }
    }

    fn after_tick(&mut self) {
        self.poller.kick();
    }

    fn chains(&self) -> Option<Arc<CounterChains>> {
        Some(self.chains.clone())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fake procfs tree for counter tests.

    use std::path::Path;

    pub fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }
}
