//! CPU busy share.

use std::sync::Arc;

use super::{COUNTER_COMMAND_TIMEOUT, SplitChain, SysPaths, parsed, read_file, tool};
use crate::command::CommandRunner;
use crate::parse;
use crate::resolver::{SourceResolver, Strategy, Validate};
use crate::sample::CpuTicks;

/// Either cumulative ticks (rate computed by the caller) or an instantaneous
/// percentage from a tool that already averaged it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CpuReading {
    Ticks(CpuTicks),
    Percent(f64),
}

impl Validate for CpuReading {
    fn validate(&self) -> Result<(), String> {
        match self {
            Self::Ticks(t) if t.total == 0 => Err("zero total ticks".into()),
            Self::Ticks(t) if t.busy > t.total => Err("busy exceeds total".into()),
            Self::Percent(p) if !p.is_finite() || *p < 0.0 => Err(format!("bad percent {p}")),
            _ => Ok(()),
        }
    }
}

/// Turns successive [`CpuReading`]s into a percentage.
#[derive(Debug, Default)]
pub struct CpuMeter {
    prev: Option<CpuTicks>,
    last: f64,
}

impl CpuMeter {
    /// The first tick-based reading has no baseline and yields 0. A reading
    /// with no ticks elapsed since the baseline repeats the last percentage.
    pub fn update(&mut self, reading: CpuReading) -> f64 {
        let pct = match reading {
            CpuReading::Ticks(t) => match self.prev {
                Some(p) if t.total == p.total => return self.last,
                Some(p) => t.percent_since(&p),
                None => 0.0,
            },
            CpuReading::Percent(p) => p.clamp(0.0, 100.0),
        };
        self.prev = match reading {
            CpuReading::Ticks(t) => Some(t),
            CpuReading::Percent(_) => None,
        };
        self.last = pct;
        pct
    }
}

pub fn resolver(paths: &SysPaths, runner: Arc<dyn CommandRunner>) -> SplitChain<CpuReading> {
    let stat = paths.proc_root.join("stat");
    let sysctl_runner = runner.clone();
    let inline = SourceResolver::new("cpu").with(Strategy::new("proc_stat", move || {
        let text = read_file(&stat)?;
        parsed("/proc/stat", parse::parse_proc_stat_cpu(&text)).map(CpuReading::Ticks)
    }));
    let tools = SourceResolver::new("cpu")
        .with(Strategy::new("sysctl_cp_time", move || {
            let text = tool(
                sysctl_runner.as_ref(),
                "sysctl",
                &["-n", "kern.cp_time"],
                COUNTER_COMMAND_TIMEOUT,
            )?;
            parsed("kern.cp_time", parse::parse_cp_time(&text)).map(CpuReading::Ticks)
        }))
        .with(Strategy::new("ps", move || {
            let text = tool(runner.as_ref(), "ps", &["-A", "-o", "%cpu="], COUNTER_COMMAND_TIMEOUT)?;
            let sum = parsed("ps", parse::parse_ps_cpu_sum(&text))?;
            let ncpu = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1) as f64;
            Ok(CpuReading::Percent(sum / ncpu))
        }));
    SplitChain { inline, tools }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::ScriptedRunner;

    #[test]
    fn meter_uses_deltas() {
        let mut m = CpuMeter::default();
        assert_eq!(m.update(CpuReading::Ticks(CpuTicks { busy: 0, total: 100 })), 0.0);
        let pct = m.update(CpuReading::Ticks(CpuTicks { busy: 25, total: 200 }));
        assert!((pct - 25.0).abs() < 1e-9);
        assert_eq!(m.update(CpuReading::Percent(140.0)), 100.0);
    }

    #[test]
    fn meter_repeats_last_percent_for_a_repeated_reading() {
        let mut m = CpuMeter::default();
        m.update(CpuReading::Ticks(CpuTicks { busy: 0, total: 100 }));
        let reading = CpuReading::Ticks(CpuTicks { busy: 40, total: 200 });
        assert_eq!(m.update(reading), 40.0);
        assert_eq!(m.update(reading), 40.0);
        let pct = m.update(CpuReading::Ticks(CpuTicks { busy: 50, total: 300 }));
        assert!((pct - 10.0).abs() < 1e-9);
    }

    #[test]
    fn falls_back_to_ps_when_no_counters() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(
            ScriptedRunner::new()
                .stdout("kern.cp_time", "")
                .stdout("ps -A", " 10.0\n 30.0\n"),
        );
        let r = resolver(&SysPaths::under(dir.path()), runner).resolve();
        assert_eq!(r.winner, Some("ps"));
        match r.value {
            Some(CpuReading::Percent(p)) => assert!(p > 0.0 && p <= 40.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_inconsistent_ticks() {
        assert!(CpuReading::Ticks(CpuTicks { busy: 5, total: 0 }).validate().is_err());
        assert!(CpuReading::Percent(f64::NAN).validate().is_err());
    }
}
