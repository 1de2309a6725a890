//! The aggregation engine: wires the tick, probes, caches, GPU sampler,
//! broadcast hub and privilege workflow together.
//!
//! ```no_run
//! use std::sync::Arc;
//! use livestat_core::{EngineConfig, Sample, TelemetryEngine};
//!
//! let engine = TelemetryEngine::builder(EngineConfig::default()).build();
//! let printer = Arc::new(|s: &Sample| println!("{:?}", s.cpu_percent));
//! engine.subscribe(&printer);
//! engine.start();
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::command::{CommandRunner, SystemCommandRunner};
use crate::config::{EngineConfig, MetricKind};
use crate::error::ProbeResult;
use crate::gpu_sampler::{BackgroundGpuSampler, GpuState};
use crate::hub::{BroadcastHub, Delivery, PublishError, SampleConsumer, SubscriptionHandle};
use crate::privilege::{BootstrapTicket, MacPrivilegeHost, PrivilegeBootstrap, PrivilegeHost, PrivilegeState};
use crate::probes::cpu::CpuMeter;
use crate::probes::network::InterfacePicker;
use crate::probes::{CounterChains, CounterSource, HostCounters, IoCounter, SysPaths, gpu};
use crate::rate::CounterRates;
use crate::readings::{ExtendedReadings, Readings};
use crate::resolver::{Resolution, SourceResolver};
use crate::sample::{CounterSnapshot, GpuUtilization, Sample};
use crate::ticker::{SampleClock, Watchdog};

/// Metric names accepted by [`TelemetryEngine::resolve_metric`].
pub const RESOLVABLE_METRICS: [&str; 10] = [
    "cpu", "memory", "disk_io", "net", "gpu", "disk", "battery", "thermal", "fan", "power",
];

/// A GPU utilization read, run on the sampler thread.
pub type GpuProbe = Arc<dyn Fn() -> ProbeResult<GpuUtilization> + Send + Sync>;

// ---------------------------------------------------------------------------
// Tick composition
// ---------------------------------------------------------------------------

/// Per-tick state: counter baselines, the chosen interface, and sequencing.
struct Composer {
    counters: Box<dyn CounterSource>,
    enabled: BTreeSet<MetricKind>,
    cpu: CpuMeter,
    rates: CounterRates,
    picker: InterfacePicker,
    sequence: u64,
    last_timestamp_ms: u64,
}

impl Composer {
    fn new(counters: Box<dyn CounterSource>, enabled: BTreeSet<MetricKind>) -> Self {
        Self {
            counters,
            enabled,
            cpu: CpuMeter::default(),
            rates: CounterRates::new(),
            picker: InterfacePicker::new(),
            sequence: 0,
            last_timestamp_ms: 0,
        }
    }

    fn on(&self, metric: MetricKind) -> bool {
        self.enabled.contains(&metric)
    }

    fn compose(&mut self, gpu: Option<GpuState>, clock: &dyn Clock) -> Sample {
        let mut sample = Sample::default();

        if self.on(MetricKind::Cpu) {
            sample.cpu_percent = ProbeResult::from_result("cpu", self.counters.cpu())
                .value
                .map(|reading| self.cpu.update(reading));
        }

        if self.on(MetricKind::Ram)
            && let Some(mem) = ProbeResult::from_result("memory", self.counters.memory()).value
        {
            sample.ram_percent = Some(mem.percent());
            sample.ram_used = Some(mem.used);
            sample.ram_available = Some(mem.available);
            sample.ram_total = Some(mem.total);
        }

        let disk = if self.on(MetricKind::Disk) {
            ProbeResult::from_result("disk_io", self.counters.disk_io()).value
        } else {
            None
        };

        let mut net = None;
        if self.on(MetricKind::Net)
            && let Some(interfaces) =
                ProbeResult::from_result("network", self.counters.interfaces()).value
        {
            let choice = self.picker.choose(&interfaces);
            if choice.switched {
                self.rates.reset_network();
            }
            sample.net_interface = choice.interface.clone();
            net = Some(choice);
        }

        let now = clock.now();
        let rates = self.rates.update(&CounterSnapshot {
            disk_read_bytes: disk.map(|d| d.read_bytes),
            disk_written_bytes: disk.map(|d| d.written_bytes),
            net_sent_bytes: net.as_ref().map(|n| n.sent),
            net_received_bytes: net.as_ref().map(|n| n.received),
            disk_at: self.counters.read_at(IoCounter::Disk).unwrap_or(now),
            net_at: self.counters.read_at(IoCounter::Network).unwrap_or(now),
        });
        self.counters.after_tick();
        sample.disk_read_bps = rates.disk_read_bps;
        sample.disk_write_bps = rates.disk_write_bps;
        sample.net_up_bps = rates.net_up_bps;
        sample.net_down_bps = rates.net_down_bps;

        if self.on(MetricKind::Gpu)
            && let Some(gpu) = gpu.and_then(|s| s.utilization)
        {
            sample.gpu_device_percent = gpu.device_percent;
            sample.gpu_render_percent = gpu.render_percent;
            sample.gpu_tiler_percent = gpu.tiler_percent;
        }

        self.sequence += 1;
        self.last_timestamp_ms = clock.unix_ms().max(self.last_timestamp_ms);
        sample.sequence = self.sequence;
        sample.timestamp_ms = self.last_timestamp_ms;
        sample
    }
}

/// Everything one tick touches, shared with the tick thread.
struct TickContext {
    composer: Mutex<Composer>,
    hub: BroadcastHub,
    gpu: Mutex<Option<BackgroundGpuSampler>>,
    clock: Arc<dyn Clock>,
}

impl TickContext {
    fn tick(&self) -> Result<Delivery, PublishError> {
        let gpu = self.gpu.lock().unwrap().as_ref().map(BackgroundGpuSampler::snapshot);
        // the composer lock is held through publish so samples leave in sequence order
        let mut composer = self.composer.lock().unwrap();
        let sample = composer.compose(gpu, self.clock.as_ref());
        let published = self.hub.publish(sample);
        drop(composer);
        if let Err(e) = &published {
            log::warn!("sample dropped: {e}");
        }
        published
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collaborators default to the real host; tests swap them out.
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    runner: Option<Arc<dyn CommandRunner>>,
    counters: Option<Box<dyn CounterSource>>,
    gpu_probe: Option<GpuProbe>,
    privilege_host: Option<Arc<dyn PrivilegeHost>>,
    paths: Option<SysPaths>,
}

impl EngineBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn counters(mut self, counters: Box<dyn CounterSource>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn gpu_probe(mut self, probe: GpuProbe) -> Self {
        self.gpu_probe = Some(probe);
        self
    }

    pub fn privilege_host(mut self, host: Arc<dyn PrivilegeHost>) -> Self {
        self.privilege_host = Some(host);
        self
    }

    /// Root for procfs and sysfs reads.
    pub fn paths(mut self, paths: SysPaths) -> Self {
        self.paths = Some(paths);
        self
    }

    pub fn build(self) -> TelemetryEngine {
        let config = self.config.normalized();
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let runner: Arc<dyn CommandRunner> =
            self.runner.unwrap_or_else(|| Arc::new(SystemCommandRunner));
        let paths = self.paths.unwrap_or_default();

        let counters = self.counters.unwrap_or_else(|| {
            Box::new(HostCounters::with_clock(runner.clone(), paths.clone(), clock.clone()))
        });
        let counter_chains = counters.chains();
        let gpu_chain = Arc::new(gpu::resolver(runner.clone(), config.privileged_timeout()));
        let gpu_probe = self.gpu_probe.unwrap_or_else(|| {
            let chain = gpu_chain.clone();
            Arc::new(move || chain.probe())
        });
        let host = self.privilege_host.unwrap_or_else(|| {
            Arc::new(MacPrivilegeHost::new(runner.clone(), config.privileged_timeout()))
        });

        let readings = Arc::new(ExtendedReadings::new(&config, runner, clock.clone(), paths));
        let privileges = PrivilegeBootstrap::new(host);
        let invalidate = readings.clone();
        privileges.on_finished(move |outcome| {
            if outcome.is_ok() {
                invalidate.invalidate_privileged();
            }
        });

        let ctx = Arc::new(TickContext {
            composer: Mutex::new(Composer::new(counters, config.enabled_metrics.clone())),
            hub: BroadcastHub::new(),
            gpu: Mutex::new(None),
            clock: clock.clone(),
        });
        let tick_ctx = ctx.clone();
        let ticker = SampleClock::new(
            move || {
                let _ = tick_ctx.tick();
            },
            config.sampling_interval_ms,
            clock.clone(),
        );

        TelemetryEngine {
            config: Mutex::new(config),
            clock,
            ctx,
            ticker,
            watchdog: Mutex::new(None),
            gpu_probe,
            gpu_chain,
            counter_chains,
            readings,
            privileges,
            started: AtomicBool::new(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct TelemetryEngine {
    config: Mutex<EngineConfig>,
    clock: Arc<dyn Clock>,
    ctx: Arc<TickContext>,
    ticker: SampleClock,
    watchdog: Mutex<Option<Watchdog>>,
    gpu_probe: GpuProbe,
    gpu_chain: Arc<SourceResolver<GpuUtilization>>,
    counter_chains: Option<Arc<CounterChains>>,
    readings: Arc<ExtendedReadings>,
    privileges: PrivilegeBootstrap,
    started: AtomicBool,
}

impl TelemetryEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            clock: None,
            runner: None,
            counters: None,
            gpu_probe: None,
            privilege_host: None,
            paths: None,
        }
    }

    /// An engine on the real host with default collaborators.
    pub fn new(config: EngineConfig) -> Self {
        Self::builder(config).build()
    }

    /// Start the GPU sampler, the tick and the watchdog. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let config = self.config();
        log::info!(
            "starting telemetry engine at {}ms for {} metric(s)",
            config.sampling_interval_ms,
            config.enabled_metrics.len()
        );

        if config.is_enabled(MetricKind::Gpu) {
            let probe = self.gpu_probe.clone();
            let sampler = BackgroundGpuSampler::spawn(
                move || probe(),
                Duration::from_millis(config.gpu_sample_period_ms),
                self.clock.clone(),
            );
            *self.ctx.gpu.lock().unwrap() = Some(sampler);
        }

        self.ticker.start();
        *self.watchdog.lock().unwrap() = Some(Watchdog::spawn(
            self.ticker.clone(),
            Duration::from_millis(config.watchdog_period_ms),
            config.watchdog_restart_interval_ms,
        ));

        if config.auto_bootstrap && self.privileges.state() == PrivilegeState::Unchecked {
            log::info!("auto-enabling privileged access");
            self.privileges.trigger();
        }
    }

    /// Compose and publish one sample on the calling thread, outside the
    /// clock. Rates need two samples; the first yields 0.
    pub fn sample_now(&self) -> Result<Delivery, PublishError> {
        self.ctx.tick()
    }

    pub fn subscribe<C>(&self, consumer: &Arc<C>) -> SubscriptionHandle
    where
        C: SampleConsumer + 'static,
    {
        self.ctx.hub.subscribe(consumer)
    }

    pub fn subscribe_dyn(&self, consumer: &Arc<dyn SampleConsumer>) -> SubscriptionHandle {
        self.ctx.hub.subscribe_dyn(consumer)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.ctx.hub.unsubscribe(handle)
    }

    /// Clamp and apply from the next tick. Returns the applied interval.
    pub fn set_interval(&self, interval_ms: u64) -> u64 {
        let applied = self.ticker.set_interval(interval_ms);
        self.config.lock().unwrap().sampling_interval_ms = applied;
        applied
    }

    pub fn interval_ms(&self) -> u64 {
        self.ticker.interval_ms()
    }

    /// Current configuration, including interval changes made at runtime.
    pub fn config(&self) -> EngineConfig {
        self.config.lock().unwrap().clone()
    }

    pub fn latest(&self) -> Option<Arc<Sample>> {
        self.ctx.hub.latest()
    }

    pub fn gpu_state(&self) -> Option<GpuState> {
        self.ctx.gpu.lock().unwrap().as_ref().map(BackgroundGpuSampler::snapshot)
    }

    pub fn is_active(&self) -> bool {
        self.ticker.is_active()
    }

    pub fn ticks(&self) -> u64 {
        self.ticker.ticks()
    }

    /// Slow readings through their caches. Runs tools; call off the UI thread.
    pub fn readings(&self) -> Readings {
        self.readings.snapshot()
    }

    pub fn extended(&self) -> &ExtendedReadings {
        &self.readings
    }

    /// Start or join the privilege workflow. Privileged caches are dropped
    /// once a run succeeds.
    pub fn trigger_privilege_bootstrap(&self) -> BootstrapTicket {
        self.privileges.trigger()
    }

    pub fn privilege_state(&self) -> PrivilegeState {
        self.privileges.state()
    }

    pub fn privileges(&self) -> &PrivilegeBootstrap {
        &self.privileges
    }

    /// Resolve one metric chain uncached and report every attempt. Runs tools
    /// on the calling thread without holding up the tick.
    pub fn resolve_metric(&self, metric: &str) -> Option<Resolution<String>> {
        if metric == "gpu" {
            return Some(self.gpu_chain.resolve().describe());
        }
        if let Some(r) = self.readings.explain(metric) {
            return Some(r);
        }
        self.counter_chains.as_ref()?.explain(metric)
    }

    /// Stop the watchdog first so it cannot restart the clock, then the clock,
    /// then the GPU sampler.
    pub fn shutdown(&self) {
        if let Some(w) = self.watchdog.lock().unwrap().take() {
            w.stop();
        }
        self.ticker.stop();
        if let Some(g) = self.ctx.gpu.lock().unwrap().take() {
            g.stop();
        }
        if self.started.swap(false, Ordering::SeqCst) {
            log::info!("telemetry engine stopped after {} tick(s)", self.ticker.ticks());
        }
    }
}

impl Drop for TelemetryEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
