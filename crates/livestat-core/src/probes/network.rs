//! Per-interface network counters and the choice of which interface to report.

use std::sync::Arc;

use super::{COUNTER_COMMAND_TIMEOUT, SplitChain, SysPaths, read_file, tool};
use crate::command::CommandRunner;
use crate::parse;
use crate::resolver::{SourceResolver, Strategy, Validate};
use crate::sample::InterfaceCounters;

/// Interface name prefixes never chosen for reporting: loopback, AirDrop,
/// low-latency WLAN, tunnels, bridges and similar virtual links.
pub const IGNORED_PREFIXES: [&str; 9] = ["lo", "awdl", "llw", "utun", "bridge", "p2p", "gif", "stf", "ap"];

/// Every interface the OS reported in one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interfaces(pub Vec<InterfaceCounters>);

impl Validate for Interfaces {
    fn validate(&self) -> Result<(), String> {
        if self.0.is_empty() {
            return Err("no interfaces".into());
        }
        Ok(())
    }
}

pub fn resolver(paths: &SysPaths, runner: Arc<dyn CommandRunner>) -> SplitChain<Interfaces> {
    let net_dev = paths.proc_root.join("net").join("dev");
    let inline = SourceResolver::new("network").with(Strategy::new("proc_net_dev", move || {
        let text = read_file(&net_dev)?;
        Ok(Interfaces(parse::parse_proc_net_dev(&text)))
    }));
    let tools = SourceResolver::new("network").with(Strategy::new("netstat", move || {
        let text = tool(runner.as_ref(), "netstat", &["-ibn"], COUNTER_COMMAND_TIMEOUT)?;
        Ok(Interfaces(parse::parse_netstat_ibn(&text)))
    }));
    SplitChain { inline, tools }
}

/// Counters to feed the rate trackers this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetChoice {
    /// `None` when no eligible interface exists and totals are reported.
    pub interface: Option<String>,
    pub sent: u64,
    pub received: u64,
    /// The measured interface changed since the previous tick; rate baselines
    /// are stale.
    pub switched: bool,
}

/// Sticky choice of the busiest eligible interface.
#[derive(Debug, Default)]
pub struct InterfacePicker {
    current: Option<String>,
    chosen: bool,
}

impl InterfacePicker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn is_eligible(name: &str) -> bool {
        !IGNORED_PREFIXES.iter().any(|p| name.starts_with(p))
    }

    /// Keep the current interface while it exists, otherwise pick the eligible
    /// one with the most traffic. Falls back to totals over everything.
    pub fn choose(&mut self, interfaces: &[InterfaceCounters]) -> NetChoice {
        let kept = self
            .current
            .as_deref()
            .and_then(|name| interfaces.iter().find(|i| i.name == name));
        let picked = kept.or_else(|| {
            interfaces
                .iter()
                .filter(|i| Self::is_eligible(&i.name))
                .max_by_key(|i| i.rx_bytes.saturating_add(i.tx_bytes))
        });

        let next = picked.map(|i| i.name.clone());
        let switched = self.chosen && next != self.current;
        if switched {
            log::debug!(
                "network interface {} -> {}",
                self.current.as_deref().unwrap_or("totals"),
                next.as_deref().unwrap_or("totals")
            );
        }
        self.current = next;
        self.chosen = true;

        match picked {
            Some(i) => NetChoice {
                interface: Some(i.name.clone()),
                sent: i.tx_bytes,
                received: i.rx_bytes,
                switched,
            },
            None => NetChoice {
                interface: None,
                sent: interfaces.iter().map(|i| i.tx_bytes).sum(),
                received: interfaces.iter().map(|i| i.rx_bytes).sum(),
                switched,
            },
        }
    }
}
