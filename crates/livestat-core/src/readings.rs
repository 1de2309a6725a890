//! Slow readings served from TTL caches.
//!
//! None of these run on the tick thread. Surfaces call them on demand (detail
//! views, the HTTP readings endpoint) and the caches bound how often the
//! underlying tools actually run.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::cache::{CachedProbe, Invalidate};
use crate::clock::Clock;
use crate::command::CommandRunner;
use crate::config::EngineConfig;
use crate::error::{ProbeError, ProbeResult};
use crate::probes::processes::{self, DEFAULT_TOP_N, TopProcesses};
use crate::probes::sensors::{self, PowermetricsText};
use crate::probes::{SysPaths, disk, gpu};
use crate::resolver::{Resolution, SourceResolver};
use crate::sample::{
    Battery, DiskMeta, DiskSpace, DiskUsage, FanReading, GpuStaticInfo, HostLoad, PowerReadings,
    Temperatures,
};

/// Every slow reading at one moment.
#[derive(Debug, Clone, Serialize)]
pub struct Readings {
    pub taken_at_ms: u64,
    pub disk_usage: ProbeResult<DiskUsage>,
    pub disk_meta: ProbeResult<DiskMeta>,
    pub gpu_static: ProbeResult<GpuStaticInfo>,
    pub battery: ProbeResult<Battery>,
    pub thermal: ProbeResult<Temperatures>,
    pub fan: ProbeResult<FanReading>,
    pub power: ProbeResult<PowerReadings>,
    pub processes: ProbeResult<TopProcesses>,
    pub load: HostLoad,
}

pub struct ExtendedReadings {
    clock: Arc<dyn Clock>,
    runner: Arc<dyn CommandRunner>,
    paths: SysPaths,
    command_timeout: Duration,
    disk_space: Arc<SourceResolver<DiskSpace>>,
    disk_usage: CachedProbe<(), DiskSpace>,
    disk_meta: CachedProbe<(), DiskMeta>,
    gpu_static: CachedProbe<(), GpuStaticInfo>,
    battery_chain: Arc<SourceResolver<Battery>>,
    battery: CachedProbe<(), Battery>,
    powermetrics: Arc<CachedProbe<String, String>>,
    thermal: SourceResolver<Temperatures>,
    fan: SourceResolver<FanReading>,
    power: SourceResolver<PowerReadings>,
    processes: CachedProbe<(), TopProcesses>,
}

impl ExtendedReadings {
    pub fn new(
        config: &EngineConfig,
        runner: Arc<dyn CommandRunner>,
        clock: Arc<dyn Clock>,
        paths: SysPaths,
    ) -> Self {
        let ttls = &config.cache_ttls;
        let timeout = config.command_timeout();
        let privileged_timeout = config.privileged_timeout();

        let disk_space = Arc::new(disk::space_resolver(runner.clone(), timeout));
        let chain = disk_space.clone();
        let disk_usage = CachedProbe::new("disk_usage", ttls.disk_usage(), clock.clone(), move |_: &()| {
            chain.probe()
        });

        let meta_runner = runner.clone();
        let disk_meta = CachedProbe::new("disk_meta", ttls.disk_meta(), clock.clone(), move |_: &()| {
            ProbeResult::from_result(
                "disk_meta",
                disk::disk_meta(meta_runner.as_ref(), timeout, privileged_timeout),
            )
        });

        let gpu_runner = runner.clone();
        let gpu_static = CachedProbe::new("gpu_static", ttls.gpu_static(), clock.clone(), move |_: &()| {
            ProbeResult::from_result("gpu_static", gpu::static_info(gpu_runner.as_ref(), timeout))
        });

        let battery_chain = Arc::new(sensors::battery_resolver(&paths, runner.clone(), timeout));
        let chain = battery_chain.clone();
        let battery = CachedProbe::new("battery", ttls.battery(), clock.clone(), move |_: &()| {
            chain.probe()
        });

        let pm_runner = runner.clone();
        let powermetrics = Arc::new(CachedProbe::new(
            "powermetrics",
            ttls.privileged_text(),
            clock.clone(),
            move |samplers: &String| {
                ProbeResult::from_result(
                    "powermetrics",
                    sensors::powermetrics_text(pm_runner.as_ref(), samplers, privileged_timeout),
                )
            },
        ));
        let text = Self::text_source(powermetrics.clone());
        let sys_root = paths.sys_root.clone();

        let ps_runner = runner.clone();
        let processes = CachedProbe::new("processes", ttls.processes(), clock.clone(), move |_: &()| {
            ProbeResult::from_result(
                "processes",
                processes::top_processes(ps_runner.as_ref(), DEFAULT_TOP_N, timeout),
            )
        });

        Self {
            clock,
            runner,
            paths,
            command_timeout: timeout,
            disk_space,
            disk_usage,
            disk_meta,
            gpu_static,
            battery_chain,
            battery,
            powermetrics,
            thermal: sensors::thermal_resolver(text.clone(), sys_root.clone()),
            fan: sensors::fan_resolver(text.clone(), sys_root.clone()),
            power: sensors::power_resolver(text, sys_root),
            processes,
        }
    }

    fn text_source(cache: Arc<CachedProbe<String, String>>) -> PowermetricsText {
        Arc::new(move |samplers: &str| {
            let result = cache.get(&samplers.to_string());
            result.value.ok_or_else(|| {
                ProbeError::unavailable(result.diagnostic.unwrap_or_else(|| "powermetrics unavailable".into()))
            })
        })
    }

    pub fn disk_usage(&self) -> ProbeResult<DiskUsage> {
        self.disk_usage.get_one().map(DiskUsage::from)
    }

    pub fn disk_meta(&self) -> ProbeResult<DiskMeta> {
        self.disk_meta.get_one()
    }

    pub fn gpu_static(&self) -> ProbeResult<GpuStaticInfo> {
        self.gpu_static.get_one()
    }

    pub fn battery(&self) -> ProbeResult<Battery> {
        self.battery.get_one()
    }

    pub fn thermal(&self) -> ProbeResult<Temperatures> {
        self.thermal.probe()
    }

    pub fn fan(&self) -> ProbeResult<FanReading> {
        self.fan.probe()
    }

    pub fn power(&self) -> ProbeResult<PowerReadings> {
        self.power.probe()
    }

    pub fn top_processes(&self) -> ProbeResult<TopProcesses> {
        self.processes.get_one()
    }

    pub fn host_load(&self) -> HostLoad {
        processes::host_load(&self.paths, self.runner.as_ref(), self.command_timeout)
    }

    pub fn snapshot(&self) -> Readings {
        Readings {
            taken_at_ms: self.clock.unix_ms(),
            disk_usage: self.disk_usage(),
            disk_meta: self.disk_meta(),
            gpu_static: self.gpu_static(),
            battery: self.battery(),
            thermal: self.thermal(),
            fan: self.fan(),
            power: self.power(),
            processes: self.top_processes(),
            load: self.host_load(),
        }
    }

    /// Drop everything gathered through elevated tools so the next read
    /// re-probes with the current privileges.
    pub fn invalidate_privileged(&self) {
        let caches: [&dyn Invalidate; 2] = [&self.disk_meta, self.powermetrics.as_ref()];
        for cache in caches {
            cache.invalidate_all();
        }
        log::debug!("privileged caches invalidated");
    }

    /// Run a chain uncached and report every attempt.
    pub fn explain(&self, metric: &str) -> Option<Resolution<String>> {
        match metric {
            "disk" | "disk_usage" => Some(self.disk_space.resolve().describe()),
            "battery" => Some(self.battery_chain.resolve().describe()),
            "thermal" => Some(self.thermal.resolve().describe()),
            "fan" => Some(self.fan.resolve().describe()),
            "power" => Some(self.power.resolve().describe()),
            _ => None,
        }
    }
}
