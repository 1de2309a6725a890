//! Integration tests for livestat-core.
//!
//! These exercise the public surface end to end: counters from a fake procfs
//! tree → rate tracking → broadcast, plus the cache, resolver, sampler and
//! privilege properties through their public types. Tests that need the real
//! host's tools are ignored by default.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use livestat_core::{
    BackgroundGpuSampler, BroadcastHub, CachedProbe, CommandOutput, CommandRunner, CommandSpec,
    EngineConfig, GpuUtilization, HostCounters, ManualClock, MetricKind, PrivilegeHost,
    PrivilegeBootstrap, ProbeError, ProbeResult, Sample, SampleConsumer, SourceResolver, Strategy,
    SysPaths, SystemClock, TelemetryEngine, Validate, rate_per_second,
};

/// Every tool is missing.
struct NoTools;

impl CommandRunner for NoTools {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProbeError> {
        Err(ProbeError::unavailable(format!("{} not found", spec.program)))
    }
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Sample>>,
}

impl SampleConsumer for Recorder {
    fn on_sample(&self, sample: &Sample) {
        self.seen.lock().unwrap().push(sample.clone());
    }
}

fn write(root: &std::path::Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn procfs(root: &std::path::Path, busy: u64, idle: u64, sectors: u64, rx: u64) {
    write(root, "proc/stat", &format!("cpu  {busy} 0 0 {idle} 0 0 0 0 0 0\n"));
    write(
        root,
        "proc/meminfo",
        "MemTotal: 16000000 kB\nMemFree: 1000000 kB\nMemAvailable: 4000000 kB\n",
    );
    write(
        root,
        "proc/diskstats",
        &format!("   8 0 sda 1 0 {sectors} 0 1 0 {sectors} 0 0 0 0 0 0 0 0\n"),
    );
    write(
        root,
        "proc/net/dev",
        &format!(
            "Inter-|   Receive\n face |bytes\n    lo: 999 0 0 0 0 0 0 0 999 0 0 0 0 0 0 0\n  eth0: {rx} 0 0 0 0 0 0 0 {rx} 0 0 0 0 0 0 0\n"
        ),
    );
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[test]
fn procfs_counters_flow_through_to_consumers() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let clock = Arc::new(ManualClock::new());
    let runner: Arc<dyn CommandRunner> = Arc::new(NoTools);

    let engine = TelemetryEngine::builder(EngineConfig::default())
        .clock(clock.clone())
        .runner(runner.clone())
        .counters(Box::new(HostCounters::with_paths(runner, SysPaths::under(root))))
        .paths(SysPaths::under(root))
        .build();
    let rec = Arc::new(Recorder::default());
    engine.subscribe(&rec);

    procfs(root, 100, 900, 0, 0);
    engine.sample_now().unwrap();
    procfs(root, 400, 1600, 2000, 10_000);
    clock.advance(Duration::from_secs(2));
    engine.sample_now().unwrap();

    let seen = rec.seen.lock().unwrap();
    let s = &seen[1];
    assert!((s.cpu_percent.unwrap() - 30.0).abs() < 1e-9);
    assert_eq!(s.ram_total, Some(16_000_000 * 1024));
    assert_eq!(s.ram_percent, Some(75.0));
    assert_eq!(s.disk_read_bps, Some(2000.0 * 512.0 / 2.0));
    assert_eq!(s.net_down_bps, Some(5000.0));
    assert_eq!(s.net_interface.as_deref(), Some("eth0"));
    assert!(s.gpu_device_percent.is_none());
}

#[test]
fn config_file_merges_over_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("livestat.json");
    std::fs::write(
        &path,
        r#"{"sampling_interval_ms": 50, "enabled_metrics": ["cpu", "net"]}"#,
    )
    .unwrap();

    let cfg = EngineConfig::load(&path).unwrap().normalized();
    assert_eq!(cfg.sampling_interval_ms, 200);
    assert!(cfg.is_enabled(MetricKind::Net));
    assert!(!cfg.is_enabled(MetricKind::Gpu));
    assert_eq!(cfg.cache_ttls.battery(), Duration::from_secs(5));

    cfg.save(&path).unwrap();
    let again = EngineConfig::load(&path).unwrap();
    assert_eq!(again.enabled_metrics, cfg.enabled_metrics);
}

// ---------------------------------------------------------------------------
// Component properties
// ---------------------------------------------------------------------------

#[test]
fn rate_matches_worked_example() {
    assert_eq!(rate_per_second(1000, 3000, 2.0), 1000.0);
    assert_eq!(rate_per_second(3000, 1000, 2.0), 0.0);
    assert!(rate_per_second(0, 10, 0.0).is_finite());
}

#[test]
fn cached_probe_honors_ttl() {
    let clock = Arc::new(ManualClock::new());
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    let probe = CachedProbe::new("disk_usage", Duration::from_secs(30), clock.clone(), move |_: &()| {
        c.fetch_add(1, Ordering::SeqCst);
        ProbeResult::ok(42u64)
    });

    probe.get(&());
    clock.advance(Duration::from_secs(10));
    probe.get(&());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    clock.advance(Duration::from_secs(21));
    assert_eq!(probe.get(&()).value, Some(42));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn cached_probe_single_flight() {
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    let probe = Arc::new(CachedProbe::new(
        "slow",
        Duration::from_secs(60),
        Arc::new(SystemClock),
        move |key: &String| {
            c.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(150));
            ProbeResult::ok(key.len())
        },
    ));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let p = probe.clone();
            std::thread::spawn(move || p.get(&"smc".to_string()).value)
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), Some(3));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[derive(Debug, Clone, PartialEq)]
struct Space {
    total: u64,
    free: u64,
}

impl Validate for Space {
    fn validate(&self) -> Result<(), String> {
        if self.free > self.total {
            return Err("free exceeds total".into());
        }
        Ok(())
    }
}

#[test]
fn resolver_stops_at_first_valid() {
    let c_runs = Arc::new(AtomicU32::new(0));
    let c = c_runs.clone();
    let chain = SourceResolver::new("disk")
        .with(Strategy::new("a", || Ok(Space { total: 10, free: 20 })))
        .with(Strategy::new("b", || Ok(Space { total: 10, free: 4 })))
        .with(Strategy::new("c", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(Space { total: 1, free: 1 })
        }));
    let r = chain.resolve();
    assert_eq!(r.value, Some(Space { total: 10, free: 4 }));
    assert_eq!(r.winner, Some("b"));
    assert_eq!(c_runs.load(Ordering::SeqCst), 0);
}

#[test]
fn gpu_sampler_recovers_after_failures() {
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    let sampler = BackgroundGpuSampler::spawn(
        move || {
            if c.fetch_add(1, Ordering::SeqCst) < 4 {
                ProbeResult::unavailable("induced")
            } else {
                ProbeResult::ok(GpuUtilization {
                    render_percent: Some(12.0),
                    ..Default::default()
                })
            }
        },
        Duration::from_millis(5),
        Arc::new(SystemClock),
    );
    let deadline = Instant::now() + Duration::from_secs(5);
    while sampler.snapshot().utilization.is_none() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(sampler.snapshot().utilization.and_then(|g| g.render_percent), Some(12.0));
}

#[test]
fn hub_delivers_identical_samples() {
    let hub = BroadcastHub::new();
    let consumers: Vec<_> = (0..3).map(|_| Arc::new(Recorder::default())).collect();
    for c in &consumers {
        hub.subscribe(c);
    }
    hub.publish(Sample {
        timestamp_ms: 10,
        sequence: 1,
        cpu_percent: Some(3.5),
        ..Sample::default()
    })
    .unwrap();
    for c in &consumers {
        let seen = c.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].cpu_percent, Some(3.5));
    }
}

struct SlowHost {
    installs: AtomicU32,
}

impl PrivilegeHost for SlowHost {
    fn capabilities_usable(&self) -> bool {
        false
    }
    fn package_manager(&self) -> Option<String> {
        Some("brew".into())
    }
    fn install_package_manager(&self) -> Result<String, String> {
        Ok(String::new())
    }
    fn tool_path(&self) -> Option<String> {
        Some("smartctl".into())
    }
    fn install_tool(&self, _: &str) -> Result<String, String> {
        Ok(String::new())
    }
    fn install_policy(&self, _: &str) -> Result<String, String> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(200));
        Err("authorization denied".into())
    }
}

#[test]
fn concurrent_bootstrap_triggers_observe_one_result() {
    let host = Arc::new(SlowHost {
        installs: AtomicU32::new(0),
    });
    let boot = PrivilegeBootstrap::new(host.clone());
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let b = boot.clone();
            std::thread::spawn(move || b.trigger().wait())
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results[0], results[1]);
    assert_eq!(results[0].as_ref().unwrap_err().reason(), "authorization denied");
    assert_eq!(host.installs.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Real host
// ---------------------------------------------------------------------------

#[test]
#[ignore] // Run with: cargo test -- --ignored
fn real_host_produces_cpu_and_memory() {
    let engine = TelemetryEngine::new(EngineConfig::default());
    engine.sample_now().unwrap();
    std::thread::sleep(Duration::from_millis(300));
    engine.sample_now().unwrap();
    let s = engine.latest().unwrap();
    assert!(s.cpu_percent.is_some(), "cpu unavailable: {:?}", engine.resolve_metric("cpu"));
    assert!(s.ram_total.unwrap_or(0) > 0);
}

#[test]
#[ignore] // Run with: cargo test -- --ignored
fn real_host_readings_serialize() {
    let engine = TelemetryEngine::new(EngineConfig::default());
    let readings = engine.readings();
    assert!(readings.disk_usage.is_available());
    let json = serde_json::to_string_pretty(&readings).unwrap();
    assert!(json.contains("disk_usage"));
}
