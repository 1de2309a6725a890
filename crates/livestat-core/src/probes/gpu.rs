//! GPU utilization chain and static GPU identity.

use std::sync::Arc;
use std::time::Duration;

use super::tool;
use crate::command::{CommandRunner, CommandSpec, Elevation};
use crate::error::ProbeError;
use crate::parse;
use crate::resolver::{SourceResolver, Strategy};
use crate::sample::{GpuStaticInfo, GpuUtilization};

pub const POWERMETRICS: &str = "/usr/bin/powermetrics";

fn powermetrics_gpu(
    runner: &dyn CommandRunner,
    elevation: Elevation,
    timeout: Duration,
) -> Result<GpuUtilization, ProbeError> {
    let spec = CommandSpec::new(POWERMETRICS)
        .args(["--samplers", "gpu_power", "-n", "1", "-i", "1000"])
        .timeout(timeout)
        .elevated(elevation);
    let out = runner.run(&spec)?;
    if !out.success {
        return Err(ProbeError::unavailable(format!(
            "{} exited with {:?}",
            spec.label(),
            out.code
        )));
    }
    Ok(parse::parse_gpu_powermetrics(&out.combined()))
}

/// Privileged powermetrics, then unprivileged powermetrics, then the
/// accelerator performance statistics in the IORegistry.
pub fn resolver(runner: Arc<dyn CommandRunner>, timeout: Duration) -> SourceResolver<GpuUtilization> {
    let sudo_runner = runner.clone();
    let plain_runner = runner.clone();
    SourceResolver::new("gpu")
        .with(Strategy::new("powermetrics_sudo", move || {
            powermetrics_gpu(sudo_runner.as_ref(), Elevation::NonInteractiveSudo, timeout)
        }))
        .with(Strategy::new("powermetrics", move || {
            powermetrics_gpu(plain_runner.as_ref(), Elevation::None, timeout)
        }))
        .with(Strategy::new("ioreg_accelerator", move || {
            let text = tool(
                runner.as_ref(),
                "/usr/sbin/ioreg",
                &["-l", "-w", "0", "-r", "-c", "IOAccelerator"],
                timeout,
            )?;
            Ok(parse::parse_ioreg_gpu(&text))
        }))
}

/// Chip name and GPU core count. Either half may be missing; both missing is
/// unavailable.
pub fn static_info(runner: &dyn CommandRunner, timeout: Duration) -> Result<GpuStaticInfo, ProbeError> {
    let timeout = timeout.max(Duration::from_secs(5));
    let profile = |data_type: &str| {
        tool(runner, "/usr/sbin/system_profiler", &[data_type, "-json"], timeout)
    };
    let hardware = profile("SPHardwareDataType").ok();
    let displays = profile("SPDisplaysDataType").ok();
    let info = parse::parse_gpu_static(hardware.as_deref(), displays.as_deref());
    if info.model.is_none() && info.cores.is_none() {
        return Err(ProbeError::unavailable("no GPU identity in system_profiler output"));
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use crate::command::testing::ScriptedRunner;

    #[test]
    fn privileged_powermetrics_preferred() {
        let runner = Arc::new(ScriptedRunner::new().stdout(
            "sudo -n /usr/bin/powermetrics",
            "GPU HW active frequency: 444 MHz\nGPU HW active residency:  12.50%\nGPU Power: 120 mW\n",
        ));
        let r = resolver(runner.clone(), Duration::from_secs(1)).resolve();
        assert_eq!(r.winner, Some("powermetrics_sudo"));
        let gpu = r.value.unwrap();
        assert_eq!(gpu.device_percent, Some(12.5));
        assert_eq!(gpu.power_watts, Some(0.12));
        assert_eq!(runner.calls_matching("ioreg"), 0);
    }

    #[test]
    fn ioreg_after_powermetrics_denied() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("powermetrics", |_| {
                    Ok(CommandOutput::failed(1, "powermetrics must be invoked as the superuser"))
                })
                .stdout(
                    "IOAccelerator",
                    r#""PerformanceStatistics" = {"Device Utilization %"=37,"Renderer Utilization %"=30,"Tiler Utilization %"=5}"#,
                ),
        );
        let r = resolver(runner, Duration::from_secs(1)).resolve();
        assert_eq!(r.winner, Some("ioreg_accelerator"));
        assert_eq!(r.attempts.len(), 3);
        let gpu = r.value.unwrap();
        assert_eq!(gpu.device_percent, Some(37.0));
        assert_eq!(gpu.tiler_percent, Some(5.0));
    }

    #[test]
    fn static_info_from_profiles() {
        let runner = ScriptedRunner::new()
            .stdout(
                "SPHardwareDataType",
                r#"{"SPHardwareDataType":[{"chip_type":"Apple M2 Pro"}]}"#,
            )
            .stdout(
                "SPDisplaysDataType",
                r#"{"SPDisplaysDataType":[{"sppci_cores":"19"}]}"#,
            );
        let info = static_info(&runner, Duration::from_secs(1)).unwrap();
        assert_eq!(info.model.as_deref(), Some("Apple M2 Pro"));
        assert_eq!(info.cores, Some(19));

        assert!(static_info(&ScriptedRunner::new(), Duration::from_secs(1)).is_err());
    }
}
