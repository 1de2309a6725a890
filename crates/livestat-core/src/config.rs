//! Engine configuration.
//!
//! Every field carries a serde default so a partial JSON file merges over the
//! defaults. Persistence policy belongs to the caller; [`EngineConfig::load`] and
//! [`EngineConfig::save`] are plain helpers.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Lowest accepted sampling interval.
pub const MIN_INTERVAL_MS: u64 = 200;
/// Highest accepted sampling interval.
pub const MAX_INTERVAL_MS: u64 = 5000;
/// Interval used at startup and by the watchdog when it restarts a stalled clock.
pub const DEFAULT_INTERVAL_MS: u64 = 500;

/// Clamp a requested sampling interval into the supported range.
pub fn clamp_interval_ms(ms: u64) -> u64 {
    ms.clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS)
}

/// A metric family of the primary sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Cpu,
    Gpu,
    Ram,
    Disk,
    Net,
}

impl MetricKind {
    pub const ALL: [MetricKind; 5] = [
        MetricKind::Cpu,
        MetricKind::Gpu,
        MetricKind::Ram,
        MetricKind::Disk,
        MetricKind::Net,
    ];
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::Ram => "ram",
            Self::Disk => "disk",
            Self::Net => "net",
        };
        f.write_str(s)
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "gpu" => Ok(Self::Gpu),
            "ram" | "mem" | "memory" => Ok(Self::Ram),
            "disk" => Ok(Self::Disk),
            "net" | "network" => Ok(Self::Net),
            other => Err(format!("unknown metric '{other}'")),
        }
    }
}

/// Time-to-live for each cached slow probe, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTtls {
    pub disk_usage_ms: u64,
    pub disk_meta_ms: u64,
    pub gpu_static_ms: u64,
    pub battery_ms: u64,
    pub privileged_text_ms: u64,
    pub processes_ms: u64,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            disk_usage_ms: 30_000,
            disk_meta_ms: 60_000,
            gpu_static_ms: 300_000,
            battery_ms: 5_000,
            privileged_text_ms: 1_000,
            processes_ms: 2_000,
        }
    }
}

impl CacheTtls {
    pub fn disk_usage(&self) -> Duration {
        Duration::from_millis(self.disk_usage_ms)
    }
    pub fn disk_meta(&self) -> Duration {
        Duration::from_millis(self.disk_meta_ms)
    }
    pub fn gpu_static(&self) -> Duration {
        Duration::from_millis(self.gpu_static_ms)
    }
    pub fn battery(&self) -> Duration {
        Duration::from_millis(self.battery_ms)
    }
    pub fn privileged_text(&self) -> Duration {
        Duration::from_millis(self.privileged_text_ms)
    }
    pub fn processes(&self) -> Duration {
        Duration::from_millis(self.processes_ms)
    }
}

/// Configuration recognized by [`crate::TelemetryEngine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sampling_interval_ms: u64,
    pub enabled_metrics: BTreeSet<MetricKind>,
    pub cache_ttls: CacheTtls,
    pub gpu_sample_period_ms: u64,
    pub watchdog_period_ms: u64,
    pub watchdog_restart_interval_ms: u64,
    /// Bound for ordinary tool invocations.
    pub command_timeout_ms: u64,
    /// Bound for privileged sampler invocations, which take about a second by themselves.
    pub privileged_timeout_ms: u64,
    /// Run the privilege bootstrap once when the engine starts.
    pub auto_bootstrap: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sampling_interval_ms: DEFAULT_INTERVAL_MS,
            enabled_metrics: MetricKind::ALL.into_iter().collect(),
            cache_ttls: CacheTtls::default(),
            gpu_sample_period_ms: 2_000,
            watchdog_period_ms: 2_000,
            watchdog_restart_interval_ms: DEFAULT_INTERVAL_MS,
            command_timeout_ms: 2_000,
            privileged_timeout_ms: 4_000,
            auto_bootstrap: false,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::debug!("config {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let cfg: EngineConfig = serde_json::from_str(&text)?;
        Ok(cfg.normalized())
    }

    /// Write as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Clamp out-of-range values into their accepted ranges.
    pub fn normalized(mut self) -> Self {
        self.sampling_interval_ms = clamp_interval_ms(self.sampling_interval_ms);
        self.watchdog_restart_interval_ms = clamp_interval_ms(self.watchdog_restart_interval_ms);
        self.gpu_sample_period_ms = self.gpu_sample_period_ms.max(100);
        self.watchdog_period_ms = self.watchdog_period_ms.max(100);
        self.command_timeout_ms = self.command_timeout_ms.max(50);
        self.privileged_timeout_ms = self.privileged_timeout_ms.max(50);
        self
    }

    pub fn is_enabled(&self, metric: MetricKind) -> bool {
        self.enabled_metrics.contains(&metric)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn privileged_timeout(&self) -> Duration {
        Duration::from_millis(self.privileged_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.sampling_interval_ms, 500);
        assert_eq!(cfg.enabled_metrics.len(), 5);
        assert_eq!(cfg.cache_ttls.disk_usage(), Duration::from_secs(30));
        assert_eq!(cfg.cache_ttls.disk_meta(), Duration::from_secs(60));
        assert_eq!(cfg.cache_ttls.gpu_static(), Duration::from_secs(300));
        assert_eq!(cfg.cache_ttls.battery(), Duration::from_secs(5));
        assert_eq!(cfg.cache_ttls.privileged_text(), Duration::from_secs(1));
    }

    #[test]
    fn partial_json_merges_over_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"sampling_interval_ms": 1000, "cache_ttls": {"battery_ms": 9000}}"#)
                .unwrap();
        assert_eq!(cfg.sampling_interval_ms, 1000);
        assert_eq!(cfg.cache_ttls.battery_ms, 9000);
        assert_eq!(cfg.cache_ttls.disk_usage_ms, 30_000);
        assert!(cfg.is_enabled(MetricKind::Net));
    }

    #[test]
    fn interval_is_clamped() {
        assert_eq!(clamp_interval_ms(10), MIN_INTERVAL_MS);
        assert_eq!(clamp_interval_ms(60_000), MAX_INTERVAL_MS);
        let cfg: EngineConfig = serde_json::from_str(r#"{"sampling_interval_ms": 50}"#).unwrap();
        assert_eq!(cfg.normalized().sampling_interval_ms, 200);
    }

    #[test]
    fn enabled_metrics_parse_lowercase() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"enabled_metrics": ["cpu", "net"]}"#).unwrap();
        assert!(cfg.is_enabled(MetricKind::Cpu));
        assert!(!cfg.is_enabled(MetricKind::Gpu));
        assert_eq!("Memory".parse::<MetricKind>(), Ok(MetricKind::Ram));
        assert!("bogus".parse::<MetricKind>().is_err());
    }

    #[test]
    fn save_then_load_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("livestat.json");
        let mut cfg = EngineConfig::default();
        cfg.sampling_interval_ms = 750;
        cfg.enabled_metrics.remove(&MetricKind::Gpu);
        cfg.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn missing_file_is_default_and_garbage_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = EngineConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(missing, EngineConfig::default());

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(EngineConfig::load(&bad), Err(ConfigError::Parse(_))));
    }
}
