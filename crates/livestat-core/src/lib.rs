//! # livestat-core
//!
//! **One steady sample stream from unreliable OS sources.**
//!
//! `livestat-core` polls CPU, GPU, memory, disk and network figures at a fixed
//! interval and fans each sample out to every registered consumer. Sources are
//! flaky by nature: tools go missing, need root, time out or change their
//! output. Every metric therefore resolves through an ordered chain of
//! strategies, slow reads sit behind TTL caches, and a failing source shows up
//! as an unavailable field rather than a failed sample.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use livestat_core::{EngineConfig, Sample, TelemetryEngine};
//!
//! let engine = TelemetryEngine::new(EngineConfig::default());
//! let printer = Arc::new(|s: &Sample| {
//!     println!("cpu {:?}% ram {:?}%", s.cpu_percent, s.ram_percent);
//! });
//! engine.subscribe(&printer);
//! engine.start();
//! ```
//!
//! ## Architecture
//!
//! SampleClock tick → counters → RateTracker → BroadcastHub → consumers
//!
//! - [`SampleClock`] ticks on its own thread; a [`Watchdog`] restarts it if it
//!   stalls (for example across host sleep).
//! - Counters read procfs on the tick thread; where procfs is missing, a
//!   [`ToolPoller`] runs the tool fallbacks and the tick takes its last result.
//! - [`RateTracker`] turns cumulative disk and network counters into per-second rates.
//! - [`SourceResolver`] walks a metric's strategies until one yields a valid value.
//! - [`CachedProbe`] bounds how often slow reads run, with single-flight for
//!   concurrent callers.
//! - [`BackgroundGpuSampler`] reads the GPU on a separate period since its
//!   tools are slow.
//! - [`PrivilegeBootstrap`] provisions passwordless access to the privileged
//!   tools, independently of sampling.

pub mod cache;
pub mod clock;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod gpu_sampler;
pub mod hub;
pub mod parse;
pub mod privilege;
pub mod probes;
pub mod rate;
pub mod readings;
pub mod resolver;
pub mod sample;
pub mod ticker;

pub use cache::{CacheEntry, CachedProbe, Invalidate};
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{CommandOutput, CommandRunner, CommandSpec, Elevation, SystemCommandRunner};
pub use config::{
    CacheTtls, DEFAULT_INTERVAL_MS, EngineConfig, MAX_INTERVAL_MS, MIN_INTERVAL_MS, MetricKind,
    clamp_interval_ms,
};
pub use engine::{EngineBuilder, GpuProbe, RESOLVABLE_METRICS, TelemetryEngine};
pub use error::{BootstrapError, ConfigError, ProbeError, ProbeResult};
pub use gpu_sampler::{BackgroundGpuSampler, GpuState};
pub use hub::{BroadcastHub, Delivery, PublishError, SampleConsumer, SubscriptionHandle};
pub use privilege::{
    BootstrapEvent, BootstrapStep, BootstrapTicket, MacPrivilegeHost, PrivilegeBootstrap,
    PrivilegeHost, PrivilegeState, SUDOERS_FILE,
};
pub use probes::processes::TopProcesses;
pub use probes::{
    CounterChains, CounterSource, HostCounters, IoCounter, Polled, SplitChain, SysPaths, ToolPoller,
};
pub use rate::{CounterRates, RateTracker, rate_per_second};
pub use readings::{ExtendedReadings, Readings};
pub use resolver::{Attempt, AttemptOutcome, Resolution, SourceResolver, Strategy, Validate};
pub use sample::{
    Battery, BatteryState, DiskMeta, DiskUsage, FanReading, GpuStaticInfo, GpuUtilization,
    HostLoad, MemoryUsage, PowerReadings, ProcessInfo, Sample, SmartHealth, Temperatures,
};
pub use ticker::{SampleClock, Watchdog};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
