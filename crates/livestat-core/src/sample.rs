//! The per-tick sample and the structured values probes hand back.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::resolver::Validate;

/// Immutable snapshot produced once per tick and shared read-only by every
/// consumer. `None` means the metric was unavailable or disabled for that tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Milliseconds since the Unix epoch. Non-decreasing across ticks.
    pub timestamp_ms: u64,
    /// Monotonic tick number starting at 1.
    pub sequence: u64,
    pub cpu_percent: Option<f64>,
    pub gpu_device_percent: Option<f64>,
    pub gpu_render_percent: Option<f64>,
    pub gpu_tiler_percent: Option<f64>,
    pub ram_percent: Option<f64>,
    pub ram_used: Option<u64>,
    pub ram_available: Option<u64>,
    pub ram_total: Option<u64>,
    pub disk_read_bps: Option<f64>,
    pub disk_write_bps: Option<f64>,
    pub net_up_bps: Option<f64>,
    pub net_down_bps: Option<f64>,
    /// Interface the network rates were measured on, if one was chosen.
    pub net_interface: Option<String>,
}

/// GPU utilization as read by the background sampler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuUtilization {
    pub device_percent: Option<f64>,
    pub render_percent: Option<f64>,
    pub tiler_percent: Option<f64>,
    pub active_frequency_mhz: Option<f64>,
    pub power_watts: Option<f64>,
}

impl GpuUtilization {
    /// At least one utilization figure is present.
    pub fn has_utilization(&self) -> bool {
        self.device_percent.is_some() || self.render_percent.is_some() || self.tiler_percent.is_some()
    }
}

/// Physical memory figures in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub total: u64,
    pub used: u64,
    pub available: u64,
}

impl MemoryUsage {
    pub fn from_total_available(total: u64, available: u64) -> Self {
        let available = available.min(total);
        Self {
            total,
            used: total - available,
            available,
        }
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.used as f64 / self.total as f64 * 100.0
    }
}

/// Cumulative I/O counters for one tick and when each pair was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub disk_read_bytes: Option<u64>,
    pub disk_written_bytes: Option<u64>,
    pub net_sent_bytes: Option<u64>,
    pub net_received_bytes: Option<u64>,
    pub disk_at: Instant,
    pub net_at: Instant,
}

/// Per-second rates computed from two counter snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IoRates {
    pub disk_read_bps: Option<f64>,
    pub disk_write_bps: Option<f64>,
    pub net_up_bps: Option<f64>,
    pub net_down_bps: Option<f64>,
}

impl Validate for GpuUtilization {
    fn validate(&self) -> Result<(), String> {
        if !self.has_utilization() {
            return Err("no utilization figures".into());
        }
        let in_range = [self.device_percent, self.render_percent, self.tiler_percent]
            .into_iter()
            .flatten()
            .all(|p| (0.0..=100.0).contains(&p));
        if !in_range {
            return Err("utilization outside 0..=100".into());
        }
        Ok(())
    }
}

impl Validate for MemoryUsage {
    fn validate(&self) -> Result<(), String> {
        if self.total == 0 {
            return Err("zero total memory".into());
        }
        Ok(())
    }
}

/// Cumulative CPU time in scheduler ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTicks {
    pub busy: u64,
    pub total: u64,
}

impl CpuTicks {
    /// Busy share between two readings, 0 when nothing elapsed or counters went
    /// backwards.
    pub fn percent_since(&self, prev: &CpuTicks) -> f64 {
        let total = self.total.saturating_sub(prev.total);
        if total == 0 {
            return 0.0;
        }
        let busy = self.busy.saturating_sub(prev.busy).min(total);
        busy as f64 / total as f64 * 100.0
    }
}

/// Byte counters for one network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceCounters {
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Capacity of the root volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpace {
    pub total: u64,
    pub free: u64,
}

impl DiskSpace {
    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.free)
    }

    pub fn percent_used(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        ((1.0 - self.free as f64 / self.total as f64) * 100.0).clamp(0.0, 100.0)
    }
}

/// [`DiskSpace`] with the derived figures consumers display.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub percent_used: f64,
}

impl From<DiskSpace> for DiskUsage {
    fn from(space: DiskSpace) -> Self {
        Self {
            total: space.total,
            free: space.free,
            used: space.used(),
            percent_used: space.percent_used(),
        }
    }
}

impl Validate for DiskSpace {
    fn validate(&self) -> Result<(), String> {
        if self.total == 0 {
            return Err("zero total".into());
        }
        if self.free > self.total {
            return Err(format!("free {} exceeds total {}", self.free, self.total));
        }
        Ok(())
    }
}

/// SMART health figures for the boot disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SmartHealth {
    pub bytes_read: Option<u64>,
    pub bytes_written: Option<u64>,
    pub temperature_c: Option<f64>,
    pub power_cycles: Option<u64>,
    pub power_on_hours: Option<u64>,
    /// 100 minus the wear indicator, or the available spare when wear is unknown.
    pub health_percent: Option<u64>,
    pub available_spare_percent: Option<u64>,
    pub passed: Option<bool>,
}

/// Identity and health of the volume mounted at `/`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskMeta {
    pub volume_name: Option<String>,
    pub volume_uuid: Option<String>,
    pub device_identifier: Option<String>,
    pub whole_disk: Option<String>,
    pub smart_status: Option<String>,
    pub smart: Option<SmartHealth>,
    pub smart_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryState {
    Charging,
    Discharging,
    Charged,
}

impl fmt::Display for BatteryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Charging => f.write_str("Charging"),
            Self::Discharging => f.write_str("On battery"),
            Self::Charged => f.write_str("Charged"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Battery {
    pub percent: Option<f64>,
    pub state: Option<BatteryState>,
}

impl Validate for Battery {
    fn validate(&self) -> Result<(), String> {
        match self.percent {
            Some(p) if (0.0..=100.0).contains(&p) => Ok(()),
            Some(p) => Err(format!("charge {p} outside 0..=100")),
            None => Err("no charge level".into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FanReading {
    pub rpm: f64,
    pub max_rpm: Option<f64>,
    pub percent: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Temperatures {
    pub cpu_c: Option<f64>,
    pub gpu_c: Option<f64>,
}

impl Validate for Temperatures {
    fn validate(&self) -> Result<(), String> {
        if self.cpu_c.is_none() && self.gpu_c.is_none() {
            return Err("no temperature lines".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerReadings {
    pub cpu_watts: Option<f64>,
    pub gpu_watts: Option<f64>,
    pub ane_watts: Option<f64>,
    pub combined_watts: Option<f64>,
}

impl PowerReadings {
    pub fn is_empty(&self) -> bool {
        self.cpu_watts.is_none()
            && self.gpu_watts.is_none()
            && self.ane_watts.is_none()
            && self.combined_watts.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuStaticInfo {
    pub model: Option<String>,
    pub cores: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub rss_bytes: u64,
    pub cpu_percent: f64,
}

/// Uptime and load average.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HostLoad {
    pub uptime_secs: Option<u64>,
    pub load_1m: Option<f64>,
    pub load_5m: Option<f64>,
    pub load_15m: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_percent_and_clamp() {
        let m = MemoryUsage::from_total_available(1000, 250);
        assert_eq!(m.used, 750);
        assert!((m.percent() - 75.0).abs() < 1e-9);

        let over = MemoryUsage::from_total_available(1000, 4000);
        assert_eq!(over.used, 0);
        assert_eq!(MemoryUsage::from_total_available(0, 0).percent(), 0.0);
    }

    #[test]
    fn sample_serializes_missing_values_as_null() {
        let s = Sample {
            timestamp_ms: 5,
            cpu_percent: Some(12.5),
            ..Sample::default()
        };
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["cpu_percent"], 12.5);
        assert!(v["gpu_device_percent"].is_null());
    }

    #[test]
    fn cpu_ticks_percent() {
        let a = CpuTicks { busy: 100, total: 1000 };
        let b = CpuTicks { busy: 150, total: 1100 };
        assert!((b.percent_since(&a) - 50.0).abs() < 1e-9);
        assert_eq!(a.percent_since(&b), 0.0);
        assert_eq!(a.percent_since(&a), 0.0);
    }

    #[test]
    fn disk_space_validity() {
        assert!(DiskSpace { total: 100, free: 40 }.validate().is_ok());
        assert!(DiskSpace { total: 100, free: 140 }.validate().is_err());
        assert!(DiskSpace { total: 0, free: 0 }.validate().is_err());
        assert!((DiskSpace { total: 200, free: 50 }.percent_used() - 75.0).abs() < 1e-9);
    }

    #[test]
    fn gpu_validity_requires_a_figure_in_range() {
        assert!(GpuUtilization::default().validate().is_err());
        let ok = GpuUtilization {
            device_percent: Some(12.0),
            ..Default::default()
        };
        assert!(ok.validate().is_ok());
        let bad = GpuUtilization {
            render_percent: Some(140.0),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn battery_state_labels() {
        assert_eq!(BatteryState::Discharging.to_string(), "On battery");
        assert!(Battery { percent: None, state: Some(BatteryState::Charged) }.validate().is_err());
    }
}
