//! Disk throughput counters, root volume capacity, and disk identity/health.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::{COUNTER_COMMAND_TIMEOUT, SplitChain, SysPaths, parsed, read_file, tool};
use crate::command::{CommandRunner, CommandSpec, Elevation};
use crate::error::ProbeError;
use crate::parse;
use crate::resolver::{SourceResolver, Strategy, Validate};
use crate::sample::{DiskMeta, DiskSpace};

const DISKUTIL: &str = "/usr/sbin/diskutil";

/// Cumulative bytes moved across all whole disks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskIo {
    pub read_bytes: u64,
    pub written_bytes: u64,
}

impl Validate for DiskIo {}

pub fn io_resolver(paths: &SysPaths, runner: Arc<dyn CommandRunner>) -> SplitChain<DiskIo> {
    let diskstats = paths.proc_root.join("diskstats");
    let inline = SourceResolver::new("disk_io").with(Strategy::new("proc_diskstats", move || {
        let text = read_file(&diskstats)?;
        let (read_bytes, written_bytes) = parsed("/proc/diskstats", parse::parse_diskstats(&text))?;
        Ok(DiskIo {
            read_bytes,
            written_bytes,
        })
    }));
    let tools = SourceResolver::new("disk_io").with(Strategy::new("ioreg_block_storage", move || {
        let text = tool(
            runner.as_ref(),
            "/usr/sbin/ioreg",
            &["-c", "IOBlockStorageDriver", "-r", "-w", "0"],
            COUNTER_COMMAND_TIMEOUT,
        )?;
        let (read_bytes, written_bytes) =
            parsed("ioreg", parse::parse_ioreg_block_storage(&text))?;
        Ok(DiskIo {
            read_bytes,
            written_bytes,
        })
    }));
    SplitChain { inline, tools }
}

/// `diskutil info <target>` as key/value pairs.
pub fn diskutil_info(
    runner: &dyn CommandRunner,
    target: &str,
    timeout: Duration,
) -> Result<HashMap<String, String>, ProbeError> {
    let text = tool(runner, DISKUTIL, &["info", target], timeout)?;
    let info = parse::parse_diskutil_info(&text);
    if info.is_empty() {
        return Err(ProbeError::unavailable("unrecognized diskutil output"));
    }
    Ok(info)
}

/// Root volume capacity: the volume resource values Finder reports, then
/// diskutil, the storage profile, `df`, and `statvfs(2)`.
pub fn space_resolver(runner: Arc<dyn CommandRunner>, timeout: Duration) -> SourceResolver<DiskSpace> {
    let diskutil_runner = runner.clone();
    let profile_runner = runner.clone();
    SourceResolver::new("disk_usage")
        .with(Strategy::new("volume_resources", volume_resources_root))
        .with(Strategy::new("diskutil", move || {
            let info = diskutil_info(diskutil_runner.as_ref(), "/", timeout)?;
            parsed("diskutil", parse::diskutil_space(&info))
        }))
        .with(Strategy::new("system_profiler", move || {
            // identity only narrows the match; mount point `/` still works without it
            let info = diskutil_info(profile_runner.as_ref(), "/", timeout).unwrap_or_default();
            let json = tool(
                profile_runner.as_ref(),
                "/usr/sbin/system_profiler",
                &["SPStorageDataType", "-json"],
                timeout.max(Duration::from_secs(5)),
            )?;
            parsed(
                "system_profiler",
                parse::parse_storage_profile(
                    &json,
                    info.get("Volume UUID").map(String::as_str),
                    info.get("Device Identifier").map(String::as_str),
                ),
            )
        }))
        .with(Strategy::new("df", move || {
            let text = tool(runner.as_ref(), "df", &["-k", "/"], timeout)?;
            parsed("df", parse::parse_df(&text))
        }))
        .with(Strategy::new("statvfs", statvfs_root))
}

/// `NSURL` volume capacity for `/`. "Available for important usage" counts
/// purgeable space the way the Storage settings pane does; diskutil and `df`
/// leave it out.
#[cfg(target_os = "macos")]
fn volume_resources_root() -> Result<DiskSpace, ProbeError> {
    use objc2_foundation::{
        NSArray, NSNumber, NSString, NSURL, NSURLResourceKey,
        NSURLVolumeAvailableCapacityForImportantUsageKey,
        NSURLVolumeAvailableCapacityForOpportunisticUsageKey, NSURLVolumeAvailableCapacityKey,
        NSURLVolumeTotalCapacityKey,
    };

    objc2::rc::autoreleasepool(|_| {
        // SAFETY: the keys are immutable Foundation constants, and every key
        // asked for is a volume capacity key whose value is an NSNumber.
        unsafe {
            let available_keys: [&NSURLResourceKey; 3] = [
                NSURLVolumeAvailableCapacityForImportantUsageKey,
                NSURLVolumeAvailableCapacityForOpportunisticUsageKey,
                NSURLVolumeAvailableCapacityKey,
            ];
            let url = NSURL::fileURLWithPath(&NSString::from_str("/"));
            let keys = NSArray::from_slice(&[
                NSURLVolumeTotalCapacityKey,
                available_keys[0],
                available_keys[1],
                available_keys[2],
            ]);
            let values = url
                .resourceValuesForKeys_error(&keys)
                .map_err(|e| ProbeError::crashed("NSURL", e.localizedDescription().to_string()))?;
            let number = |key: &NSURLResourceKey| {
                values
                    .objectForKey(key)
                    .and_then(|v| v.downcast_ref::<NSNumber>().map(NSNumber::as_u64))
                    .filter(|n| *n > 0)
            };

            let total = number(NSURLVolumeTotalCapacityKey)
                .ok_or_else(|| ProbeError::unavailable("no volume total capacity"))?;
            let free = available_keys
                .into_iter()
                .find_map(number)
                .ok_or_else(|| ProbeError::unavailable("no volume available capacity"))?;
            Ok(DiskSpace { total, free })
        }
    })
}

#[cfg(not(target_os = "macos"))]
fn volume_resources_root() -> Result<DiskSpace, ProbeError> {
    Err(ProbeError::unavailable("volume resource values require macOS"))
}

#[cfg(unix)]
fn statvfs_root() -> Result<DiskSpace, ProbeError> {
    // SAFETY: an all-zero statvfs is a valid out-parameter.
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: the path is a valid NUL-terminated string and `st` outlives the call.
    let rc = unsafe { libc::statvfs(c"/".as_ptr(), &mut st) };
    if rc != 0 {
        return Err(ProbeError::crashed(
            "statvfs",
            std::io::Error::last_os_error().to_string(),
        ));
    }
    let frsize = st.f_frsize as u64;
    Ok(DiskSpace {
        total: st.f_blocks as u64 * frsize,
        free: st.f_bavail as u64 * frsize,
    })
}

#[cfg(not(unix))]
fn statvfs_root() -> Result<DiskSpace, ProbeError> {
    Err(ProbeError::unavailable("statvfs requires unix"))
}

/// Locate smartctl: `$PATH` first, then the usual Homebrew prefixes.
pub fn find_smartctl(runner: &dyn CommandRunner) -> Option<String> {
    if let Some(path) = runner.which("smartctl") {
        return Some(path);
    }
    [
        "/opt/homebrew/sbin/smartctl",
        "/opt/homebrew/bin/smartctl",
        "/usr/local/sbin/smartctl",
        "/usr/local/bin/smartctl",
    ]
    .into_iter()
    .find(|p| Path::new(p).exists())
    .map(str::to_string)
}

/// `smartctl -a -j` through `sudo -n`, first as NVMe then autodetected.
/// smartctl sets exit bits for mere warnings, so any parseable JSON counts.
pub fn smartctl_json(
    runner: &dyn CommandRunner,
    smartctl: &str,
    device: &str,
    timeout: Duration,
) -> Result<Value, String> {
    let mut last_err = String::from("smartctl failed");
    for nvme in [true, false] {
        let mut spec = CommandSpec::new(smartctl).args(["-a", "-j"]);
        if nvme {
            spec = spec.args(["-d", "nvme"]);
        }
        let spec = spec
            .arg(device)
            .timeout(timeout)
            .elevated(Elevation::NonInteractiveSudo);
        match runner.run(&spec) {
            Ok(out) => match parse::extract_json_block(&out.combined()) {
                Some(doc) => return Ok(doc),
                None => {
                    last_err = if out.stderr.trim().is_empty() {
                        "smartctl output not JSON".to_string()
                    } else {
                        out.stderr.trim().to_string()
                    }
                }
            },
            Err(e) => last_err = e.to_string(),
        }
    }
    Err(last_err)
}

/// Whole-disk device backing `/`, for example `/dev/disk3`.
pub fn root_disk_device(runner: &dyn CommandRunner, timeout: Duration) -> String {
    let whole = diskutil_info(runner, "/", timeout)
        .ok()
        .and_then(|info| info.get("Device Identifier").cloned())
        .map(|d| parse::whole_disk(&d))
        .unwrap_or_else(|| "disk0".to_string());
    format!("/dev/{whole}")
}

/// Volume identity plus SMART data for the boot disk. SMART failures are
/// recorded in the result rather than failing the probe.
pub fn disk_meta(
    runner: &dyn CommandRunner,
    timeout: Duration,
    privileged_timeout: Duration,
) -> Result<DiskMeta, ProbeError> {
    let info = diskutil_info(runner, "/", timeout)?;
    let mut meta = DiskMeta {
        volume_name: info.get("Volume Name").cloned(),
        volume_uuid: info.get("Volume UUID").cloned(),
        device_identifier: info.get("Device Identifier").cloned(),
        ..DiskMeta::default()
    };
    let Some(device) = meta.device_identifier.clone() else {
        return Ok(meta);
    };
    let whole = parse::whole_disk(&device);
    if let Ok(disk) = diskutil_info(runner, &whole, timeout) {
        meta.smart_status = disk.get("SMART Status").cloned();
    }
    meta.whole_disk = Some(whole.clone());

    match find_smartctl(runner) {
        Some(smartctl) => {
            match smartctl_json(runner, &smartctl, &format!("/dev/{whole}"), privileged_timeout) {
                Ok(doc) => meta.smart = Some(parse::parse_smartctl(&doc)),
                Err(e) => {
                    log::debug!("smartctl: {e}");
                    meta.smart_error = Some(e);
                }
            }
        }
        None => meta.smart_error = Some("smartctl not found".to_string()),
    }
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use crate::command::testing::ScriptedRunner;
    use crate::resolver::AttemptOutcome;

    const ROOT_INFO: &str = "\
   Device Identifier:         disk3s1s1
   Volume Name:               Macintosh HD
   Volume UUID:               AAAA-BBBB
   Container Total Space:     494.4 GB (494384795648 Bytes)
   Volume Free Space:         100.0 GB (100000000000 Bytes)
   Container Free Space:      120.0 GB (120000000000 Bytes)
";

    // -----------------------------------------------------------------------
    // Capacity chain
    // -----------------------------------------------------------------------

    #[test]
    fn volume_resources_lead_the_chain() {
        let runner = Arc::new(ScriptedRunner::new());
        let chain = space_resolver(runner, Duration::from_secs(1));
        assert_eq!(
            chain.strategy_names(),
            ["volume_resources", "diskutil", "system_profiler", "df", "statvfs"]
        );
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn volume_resources_report_root_capacity() {
        let space = volume_resources_root().unwrap();
        assert!(space.total > 0);
        assert!(space.free > 0 && space.free <= space.total);
    }

    #[cfg_attr(target_os = "macos", ignore = "the volume resource query answers first on macOS")]
    #[test]
    fn diskutil_wins_when_complete() {
        let runner = Arc::new(ScriptedRunner::new().stdout("diskutil info /", ROOT_INFO));
        let r = space_resolver(runner.clone(), Duration::from_secs(1)).resolve();
        assert_eq!(r.winner, Some("diskutil"));
        let space = r.value.unwrap();
        assert_eq!(space.total, 494_384_795_648);
        assert_eq!(space.free, 120_000_000_000);
        assert_eq!(runner.calls_matching("system_profiler"), 0);
    }

    #[cfg_attr(target_os = "macos", ignore = "the volume resource query answers first on macOS")]
    #[test]
    fn df_used_when_diskutil_reports_free_above_total() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .stdout(
                    "diskutil info /",
                    "Container Total Space: 10 GB (10 Bytes)\nFree Space: 20 GB (20 Bytes)\n",
                )
                .stdout(
                    "df -k /",
                    "Filesystem 1K-blocks Used Available Capacity Mounted\n/dev/disk3s1 1000 600 400 60% /\n",
                ),
        );
        let r = space_resolver(runner, Duration::from_secs(1)).resolve();
        assert_eq!(r.winner, Some("df"));
        assert_eq!(r.value, Some(DiskSpace { total: 1_024_000, free: 409_600 }));
        assert_eq!(r.attempts.len(), 4);
        assert!(matches!(r.attempts[0].outcome, AttemptOutcome::Failed(_)));
    }

    #[test]
    fn statvfs_is_last_resort() {
        let runner = Arc::new(ScriptedRunner::new());
        let r = space_resolver(runner, Duration::from_secs(1)).resolve();
        #[cfg(all(unix, not(target_os = "macos")))]
        {
            assert_eq!(r.attempts.last().map(|a| a.strategy), Some("statvfs"));
            assert_eq!(r.winner, Some("statvfs"));
        }
        #[cfg(target_os = "macos")]
        assert!(r.winner.is_some());
    }

    // -----------------------------------------------------------------------
    // Throughput counters
    // -----------------------------------------------------------------------

    #[test]
    fn ioreg_used_without_procfs() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().stdout(
            "IOBlockStorageDriver",
            r#""Statistics" = {"Bytes (Read)"=1000,"Bytes (Write)"=500}"#,
        ));
        let r = io_resolver(&SysPaths::under(dir.path()), runner).resolve();
        assert_eq!(r.winner, Some("ioreg_block_storage"));
        assert_eq!(
            r.value,
            Some(DiskIo {
                read_bytes: 1000,
                written_bytes: 500
            })
        );
    }

    // -----------------------------------------------------------------------
    // Identity and SMART
    // -----------------------------------------------------------------------

    #[test]
    fn meta_collects_identity_and_smart() {
        let runner = ScriptedRunner::new()
            .stdout("diskutil info disk3", "Device Identifier: disk3\nSMART Status: Verified\n")
            .stdout("diskutil info /", ROOT_INFO)
            .stdout("which smartctl", "/opt/homebrew/bin/smartctl")
            .on("-d nvme", |_| Ok(CommandOutput::failed(4, "")))
            .on("smartctl -a -j /dev/disk3", |_| {
                let mut out = CommandOutput::ok(
                    r#"{"smart_status":{"passed":true},"nvme_smart_health_information_log":{"percentage_used":3,"temperature":38}}"#,
                );
                out.success = false;
                Ok(out)
            });
        let meta = disk_meta(&runner, Duration::from_secs(1), Duration::from_secs(1)).unwrap();
        assert_eq!(meta.volume_name.as_deref(), Some("Macintosh HD"));
        assert_eq!(meta.whole_disk.as_deref(), Some("disk3"));
        assert_eq!(meta.smart_status.as_deref(), Some("Verified"));
        let smart = meta.smart.unwrap();
        assert_eq!(smart.health_percent, Some(97));
        assert_eq!(smart.passed, Some(true));
        assert!(meta.smart_error.is_none());
        assert_eq!(runner.calls_matching("sudo -n /opt/homebrew/bin/smartctl"), 2);
    }

    #[test]
    fn meta_records_smart_error_without_failing() {
        let runner = ScriptedRunner::new()
            .stdout("diskutil info /", ROOT_INFO)
            .stdout("which smartctl", "/usr/local/bin/smartctl")
            .on("smartctl", |_| Ok(CommandOutput::failed(1, "sudo: a password is required")));
        let meta = disk_meta(&runner, Duration::from_secs(1), Duration::from_secs(1)).unwrap();
        assert!(meta.smart.is_none());
        assert_eq!(meta.smart_error.as_deref(), Some("sudo: a password is required"));
    }

    #[test]
    fn smartctl_retries_with_autodetect_when_nvme_gives_no_json() {
        let runner = ScriptedRunner::new()
            .on("-d nvme", |_| {
                Ok(CommandOutput::failed(1, "/dev/disk0: Unknown device type 'nvme'"))
            })
            .stdout("smartctl -a -j /dev/disk0", r#"{"smart_status":{"passed":true}}"#);
        let doc = smartctl_json(&runner, "/usr/local/bin/smartctl", "/dev/disk0", Duration::from_secs(1))
            .unwrap();
        assert_eq!(doc["smart_status"]["passed"], true);
        assert_eq!(runner.calls_matching("-d nvme"), 1);
        assert_eq!(runner.calls_matching("smartctl -a -j /dev/disk0"), 1);
        // both attempts go through non-interactive sudo
        assert_eq!(runner.calls_matching("sudo -n"), 2);
    }

    #[test]
    fn smartctl_reports_the_last_stderr_when_both_attempts_fail() {
        let runner = ScriptedRunner::new()
            .on("-d nvme", |_| Ok(CommandOutput::failed(1, "nvme: open failed")))
            .on("smartctl -a -j /dev/disk0", |_| {
                Ok(CommandOutput::failed(1, "  sudo: a password is required\n"))
            });
        let err = smartctl_json(&runner, "/usr/local/bin/smartctl", "/dev/disk0", Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(err, "sudo: a password is required");
    }

    #[test]
    fn smartctl_without_stderr_or_json_says_so() {
        let runner = ScriptedRunner::new().stdout("smartctl", "not json at all");
        let err = smartctl_json(&runner, "/usr/local/bin/smartctl", "/dev/disk0", Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(err, "smartctl output not JSON");
    }

    #[test]
    fn root_device_defaults_to_disk0() {
        let runner = ScriptedRunner::new();
        assert_eq!(root_disk_device(&runner, Duration::from_secs(1)), "/dev/disk0");
    }
}
