//! Physical memory.

use std::sync::{Arc, Mutex};

use super::{COUNTER_COMMAND_TIMEOUT, SplitChain, SysPaths, parsed, read_file, tool};
use crate::command::CommandRunner;
use crate::error::ProbeError;
use crate::parse;
use crate::resolver::{SourceResolver, Strategy};
use crate::sample::MemoryUsage;

pub fn resolver(paths: &SysPaths, runner: Arc<dyn CommandRunner>) -> SplitChain<MemoryUsage> {
    let meminfo = paths.proc_root.join("meminfo");
    // hw.memsize never changes while the process lives.
    let memsize: Mutex<Option<u64>> = Mutex::new(None);
    let inline = SourceResolver::new("memory").with(Strategy::new("proc_meminfo", move || {
        let text = read_file(&meminfo)?;
        parsed("/proc/meminfo", parse::parse_meminfo(&text))
    }));
    let tools = SourceResolver::new("memory").with(Strategy::new("vm_stat", move || {
        let total = {
            let mut cached = memsize.lock().unwrap();
            match *cached {
                Some(t) => t,
                None => {
                    let raw = tool(
                        runner.as_ref(),
                        "sysctl",
                        &["-n", "hw.memsize"],
                        COUNTER_COMMAND_TIMEOUT,
                    )?;
                    let t = raw.trim().parse::<u64>().map_err(|_| {
                        ProbeError::crashed("sysctl", format!("bad hw.memsize '{raw}'"))
                    })?;
                    *cached = Some(t);
                    t
                }
            }
        };
        let text = tool(runner.as_ref(), "vm_stat", &[], COUNTER_COMMAND_TIMEOUT)?;
        let vm = parsed("vm_stat", parse::parse_vm_stat(&text))?;
        Ok(MemoryUsage::from_total_available(total, vm.available_bytes()))
    }));
    SplitChain { inline, tools }
}
