//! Thermal, fan, power and battery readings.
//!
//! On macOS these come from `powermetrics` text, which needs root for most
//! samplers. On Linux the hwmon and power_supply classes in sysfs stand in.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::gpu::POWERMETRICS;
use super::{SysPaths, read_file, tool};
use crate::command::{CommandRunner, CommandSpec, Elevation};
use crate::error::ProbeError;
use crate::parse;
use crate::resolver::{SourceResolver, Strategy, Validate};
use crate::sample::{Battery, FanReading, PowerReadings, Temperatures};

/// Fetches raw powermetrics output for a sampler set, usually through a cache.
pub type PowermetricsText = Arc<dyn Fn(&str) -> Result<String, ProbeError> + Send + Sync>;

/// One `powermetrics -n 1` run for `samplers`: `sudo -n` first, then
/// unprivileged. Output from either stream counts.
pub fn powermetrics_text(
    runner: &dyn CommandRunner,
    samplers: &str,
    timeout: Duration,
) -> Result<String, ProbeError> {
    let mut last = ProbeError::unavailable("powermetrics produced no output");
    for elevation in [Elevation::NonInteractiveSudo, Elevation::None] {
        let spec = CommandSpec::new(POWERMETRICS)
            .args(["--samplers", samplers, "-n", "1", "-i", "1000"])
            .timeout(timeout)
            .elevated(elevation);
        match runner.run(&spec) {
            Ok(out) if out.success && !out.combined().trim().is_empty() => {
                return Ok(out.combined());
            }
            Ok(out) => {
                last = ProbeError::unavailable(format!(
                    "{} exited with {:?}",
                    spec.label(),
                    out.code
                ))
            }
            Err(e) => last = e,
        }
    }
    Err(last)
}

impl Validate for FanReading {
    fn validate(&self) -> Result<(), String> {
        if !self.rpm.is_finite() || self.rpm < 0.0 {
            return Err(format!("bad fan speed {}", self.rpm));
        }
        Ok(())
    }
}

impl Validate for PowerReadings {
    fn validate(&self) -> Result<(), String> {
        if self.is_empty() {
            return Err("no power lines".into());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// hwmon
// ---------------------------------------------------------------------------

const CPU_CHIPS: [&str; 5] = ["coretemp", "k10temp", "zenpower", "cpu_thermal", "acpitz"];
const GPU_CHIPS: [&str; 3] = ["amdgpu", "nouveau", "radeon"];

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn read_number(path: &Path) -> Option<f64> {
    read_trimmed(path).and_then(|s| s.parse::<f64>().ok())
}

/// `(chip name, directory)` for every hwmon device, sorted for stable choice.
fn hwmon_chips(sys_root: &Path) -> Result<Vec<(String, PathBuf)>, ProbeError> {
    let root = sys_root.join("class").join("hwmon");
    let entries = std::fs::read_dir(&root)
        .map_err(|_| ProbeError::unavailable(format!("{} missing", root.display())))?;
    let mut chips: Vec<(String, PathBuf)> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .map(|p| (read_trimmed(&p.join("name")).unwrap_or_default(), p))
        .collect();
    chips.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(chips)
}

/// First `<prefix>N_<suffix>` file in `dir` holding a number.
fn first_input(dir: &Path, prefix: &str, suffix: &str) -> Option<f64> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.starts_with(prefix) && n.ends_with(suffix))
        .collect();
    names.sort();
    names.iter().find_map(|n| read_number(&dir.join(n)))
}

pub fn hwmon_temperatures(sys_root: &Path) -> Result<Temperatures, ProbeError> {
    let chips = hwmon_chips(sys_root)?;
    let temp_of = |names: &[&str]| {
        chips
            .iter()
            .filter(|(name, _)| names.contains(&name.as_str()))
            .find_map(|(_, dir)| first_input(dir, "temp", "_input"))
            .map(|milli| milli / 1000.0)
    };
    Ok(Temperatures {
        cpu_c: temp_of(&CPU_CHIPS),
        gpu_c: temp_of(&GPU_CHIPS),
    })
}

pub fn hwmon_fan(sys_root: &Path) -> Result<FanReading, ProbeError> {
    for (_, dir) in hwmon_chips(sys_root)? {
        let Some(rpm) = first_input(&dir, "fan", "_input") else {
            continue;
        };
        let max_rpm = first_input(&dir, "fan", "_max").filter(|m| *m > 0.0);
        return Ok(FanReading {
            rpm,
            max_rpm,
            percent: max_rpm.map(|m| (rpm / m * 100.0).clamp(0.0, 100.0)),
        });
    }
    Err(ProbeError::unavailable("no hwmon fan inputs"))
}

/// hwmon power inputs are microwatts.
pub fn hwmon_power(sys_root: &Path) -> Result<PowerReadings, ProbeError> {
    let chips = hwmon_chips(sys_root)?;
    let watts_of = |names: &[&str]| {
        chips
            .iter()
            .filter(|(name, _)| names.contains(&name.as_str()))
            .find_map(|(_, dir)| {
                first_input(dir, "power", "_input").or_else(|| first_input(dir, "power", "_average"))
            })
            .map(|micro| micro / 1_000_000.0)
    };
    Ok(PowerReadings {
        cpu_watts: watts_of(&["zenpower", "k10temp", "rapl"]),
        gpu_watts: watts_of(&GPU_CHIPS),
        ane_watts: None,
        combined_watts: None,
    })
}

// ---------------------------------------------------------------------------
// Resolver chains
// ---------------------------------------------------------------------------

pub fn thermal_resolver(text: PowermetricsText, sys_root: PathBuf) -> SourceResolver<Temperatures> {
    SourceResolver::new("thermal")
        .with(Strategy::new("powermetrics_smc", move || {
            text("smc").map(|out| parse::parse_temperatures(&out))
        }))
        .with(Strategy::new("hwmon", move || hwmon_temperatures(&sys_root)))
}

pub fn fan_resolver(text: PowermetricsText, sys_root: PathBuf) -> SourceResolver<FanReading> {
    SourceResolver::new("fan")
        .with(Strategy::new("powermetrics_smc", move || {
            let out = text("smc")?;
            parse::parse_fan(&out).ok_or_else(|| ProbeError::unavailable("no fan lines"))
        }))
        .with(Strategy::new("hwmon", move || hwmon_fan(&sys_root)))
}

pub fn power_resolver(text: PowermetricsText, sys_root: PathBuf) -> SourceResolver<PowerReadings> {
    SourceResolver::new("power")
        .with(Strategy::new("powermetrics_power", move || {
            text("cpu_power,gpu_power").map(|out| parse::parse_power(&out))
        }))
        .with(Strategy::new("hwmon", move || hwmon_power(&sys_root)))
}

/// First `BAT*` supply with a capacity, then `pmset -g batt`.
pub fn battery_resolver(
    paths: &SysPaths,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
) -> SourceResolver<Battery> {
    let supplies = paths.sys_root.join("class").join("power_supply");
    SourceResolver::new("battery")
        .with(Strategy::new("sysfs_power_supply", move || {
            let entries = std::fs::read_dir(&supplies)
                .map_err(|_| ProbeError::unavailable("no power_supply class"))?;
            let mut dirs: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("BAT"))
                })
                .collect();
            dirs.sort();
            dirs.iter()
                .find_map(|dir| {
                    let capacity = read_file(&dir.join("capacity")).ok()?;
                    Some(Battery {
                        percent: capacity.trim().parse::<f64>().ok(),
                        state: read_file(&dir.join("status"))
                            .ok()
                            .and_then(|s| parse::parse_sysfs_battery_status(&s)),
                    })
                })
                .ok_or_else(|| ProbeError::unavailable("no battery"))
        }))
        .with(Strategy::new("pmset", move || {
            let text = tool(runner.as_ref(), "/usr/bin/pmset", &["-g", "batt"], timeout)?;
            let (percent, state) = parse::parse_pmset(&text);
            Ok(Battery { percent, state })
        }))
}
