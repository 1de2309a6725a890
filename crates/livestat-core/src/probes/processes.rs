//! Top processes, uptime and load average.

use std::time::Duration;

use serde::Serialize;

use super::{SysPaths, read_file, tool};
use crate::clock::unix_ms_now;
use crate::command::CommandRunner;
use crate::error::ProbeError;
use crate::parse;
use crate::sample::{HostLoad, ProcessInfo};

pub const DEFAULT_TOP_N: usize = 10;

/// Heaviest processes by resident memory and by CPU share.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TopProcesses {
    pub by_memory: Vec<ProcessInfo>,
    pub by_cpu: Vec<ProcessInfo>,
}

impl TopProcesses {
    pub fn rank(mut all: Vec<ProcessInfo>, limit: usize) -> Self {
        all.sort_by(|a, b| b.rss_bytes.cmp(&a.rss_bytes));
        let by_memory = all.iter().take(limit).cloned().collect();
        all.sort_by(|a, b| b.cpu_percent.total_cmp(&a.cpu_percent));
        all.truncate(limit);
        Self {
            by_memory,
            by_cpu: all,
        }
    }
}

pub fn top_processes(
    runner: &dyn CommandRunner,
    limit: usize,
    timeout: Duration,
) -> Result<TopProcesses, ProbeError> {
    let text = tool(runner, "ps", &["-Ao", "pid=,rss=,pcpu=,comm="], timeout)?;
    let all = parse::parse_ps_processes(&text);
    if all.is_empty() {
        return Err(ProbeError::unavailable("unrecognized ps output"));
    }
    Ok(TopProcesses::rank(all, limit))
}

fn loadavg() -> (Option<f64>, Option<f64>, Option<f64>) {
    #[cfg(unix)]
    {
        let mut values = [0.0_f64; 3];
        // SAFETY: `getloadavg` writes up to `n` doubles to a valid buffer.
        let n = unsafe { libc::getloadavg(values.as_mut_ptr(), 3) };
        if n <= 0 {
            (None, None, None)
        } else {
            (
                Some(values[0]),
                (n > 1).then_some(values[1]),
                (n > 2).then_some(values[2]),
            )
        }
    }
    #[cfg(not(unix))]
    {
        (None, None, None)
    }
}

/// `sysctl -n kern.boottime`: `{ sec = 1700000000, usec = 0 } Tue Nov 14 ...`.
pub fn parse_boottime_secs(text: &str) -> Option<u64> {
    let rest = text.split("sec =").nth(1)?;
    rest.trim_start()
        .split(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()
}

fn uptime_secs(paths: &SysPaths, runner: &dyn CommandRunner, timeout: Duration) -> Option<u64> {
    if let Ok(text) = read_file(&paths.proc_root.join("uptime")) {
        return text
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<f64>().ok())
            .map(|s| s as u64);
    }
    let boot = tool(runner, "sysctl", &["-n", "kern.boottime"], timeout)
        .ok()
        .and_then(|t| parse_boottime_secs(&t))?;
    Some((unix_ms_now() / 1000).saturating_sub(boot))
}

/// Uptime plus 1/5/15 minute load. Each figure is independently optional.
pub fn host_load(paths: &SysPaths, runner: &dyn CommandRunner, timeout: Duration) -> HostLoad {
    let (load_1m, load_5m, load_15m) = loadavg();
    HostLoad {
        uptime_secs: uptime_secs(paths, runner, timeout),
        load_1m,
        load_5m,
        load_15m,
    }
}
