//! Parsers for external tool and procfs output.
//!
//! Tool output formats are undocumented and drift between OS releases. Every
//! parser here is total: input it does not recognize yields `None` or an empty
//! collection, never a panic.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::sample::{
    BatteryState, CpuTicks, DiskSpace, FanReading, GpuStaticInfo, GpuUtilization,
    InterfaceCounters, MemoryUsage, PowerReadings, ProcessInfo, SmartHealth, Temperatures,
};

// ---------------------------------------------------------------------------
// Unit-adjacent numbers
// ---------------------------------------------------------------------------

static PERCENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([0-9.]+)\s*%").unwrap());
static RPM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)([0-9.]+)\s*rpm").unwrap());
static POWER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)([0-9.]+)\s*(mW|W)\b").unwrap());
static MEGAHERTZ: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)([0-9.]+)\s*MHz").unwrap());
static CELSIUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9.]+)\s*°?\s*[Cc]\b").unwrap());

/// Units recognized next to a number in tool output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Percent,
    Rpm,
    /// `mW` or `W`, reported in watts.
    Watts,
    Megahertz,
    Celsius,
}

impl Unit {
    fn regex(self) -> &'static Regex {
        match self {
            Self::Percent => &PERCENT,
            Self::Rpm => &RPM,
            Self::Watts => &POWER,
            Self::Megahertz => &MEGAHERTZ,
            Self::Celsius => &CELSIUS,
        }
    }

    /// First number on `line` directly followed by this unit.
    pub fn extract(self, line: &str) -> Option<f64> {
        for caps in self.regex().captures_iter(line) {
            let Ok(value) = caps[1].parse::<f64>() else {
                continue;
            };
            if self == Self::Watts && caps[2].eq_ignore_ascii_case("mw") {
                return Some(value / 1000.0);
            }
            return Some(value);
        }
        None
    }
}

/// Case-insensitive line patterns, compiled once.
pub struct LinePatterns(Vec<Regex>);

impl LinePatterns {
    pub fn new(patterns: &[&str]) -> Self {
        Self(
            patterns
                .iter()
                .filter_map(|p| Regex::new(&format!("(?i){p}")).ok())
                .collect(),
        )
    }

    pub fn matches(&self, line: &str) -> bool {
        self.0.iter().any(|re| re.is_match(line))
    }
}

/// Scan `output` line by line; on the first line matching any pattern that also
/// carries a number in `unit`, return that number.
pub fn find_reading(output: &str, patterns: &LinePatterns, unit: Unit) -> Option<f64> {
    output
        .lines()
        .filter(|line| patterns.matches(line))
        .find_map(|line| unit.extract(line))
}

// ---------------------------------------------------------------------------
// powermetrics
// ---------------------------------------------------------------------------

static CPU_TEMP: LazyLock<LinePatterns> = LazyLock::new(|| {
    LinePatterns::new(&["CPU die temperature", "CPU temperature", r"\bCPU Temp"])
});
static GPU_TEMP: LazyLock<LinePatterns> = LazyLock::new(|| {
    LinePatterns::new(&["GPU die temperature", "GPU temperature", r"\bGPU Temp"])
});
static FAN_LINE: LazyLock<LinePatterns> = LazyLock::new(|| LinePatterns::new(&["fan"]));
static FAN_MAX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)max[^0-9]*([0-9.]+)\s*rpm").unwrap());
static GPU_ACTIVE: LazyLock<LinePatterns> =
    LazyLock::new(|| LinePatterns::new(&[r"gpu.*active\s*residency"]));
static GPU_IDLE: LazyLock<LinePatterns> =
    LazyLock::new(|| LinePatterns::new(&[r"gpu.*idle\s*residency"]));
static GPU_FREQ: LazyLock<LinePatterns> =
    LazyLock::new(|| LinePatterns::new(&[r"gpu.*active\s*frequency"]));
static POWER_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)power").unwrap());

/// CPU and GPU die temperatures from `powermetrics --samplers smc`.
pub fn parse_temperatures(output: &str) -> Temperatures {
    Temperatures {
        cpu_c: find_reading(output, &CPU_TEMP, Unit::Celsius),
        gpu_c: find_reading(output, &GPU_TEMP, Unit::Celsius),
    }
}

/// Fan speed from `powermetrics --samplers smc`. The first fan line with an rpm
/// figure gives the speed; a `max … rpm` figure on any fan line gives the ceiling.
pub fn parse_fan(output: &str) -> Option<FanReading> {
    let mut rpm = None;
    let mut max_rpm = None;
    for line in output.lines().filter(|l| FAN_LINE.matches(l)) {
        if max_rpm.is_none()
            && let Some(caps) = FAN_MAX.captures(line)
        {
            max_rpm = caps[1].parse::<f64>().ok();
        }
        if rpm.is_none() {
            rpm = Unit::Rpm.extract(line);
        }
    }
    let rpm = rpm?;
    let percent = max_rpm
        .filter(|m| *m > 0.0)
        .map(|m| (rpm / m * 100.0).clamp(0.0, 100.0));
    Some(FanReading {
        rpm,
        max_rpm,
        percent,
    })
}

/// Watts on the first line mentioning both `label` and "power".
pub fn find_power_watts(output: &str, label: &str) -> Option<f64> {
    let escaped = regex::escape(label);
    let label = LinePatterns::new(&[escaped.as_str()]);
    output
        .lines()
        .filter(|l| label.matches(l) && POWER_WORD.is_match(l))
        .find_map(|l| Unit::Watts.extract(l))
}

/// Package power split from `powermetrics --samplers cpu_power,gpu_power`.
pub fn parse_power(output: &str) -> PowerReadings {
    PowerReadings {
        cpu_watts: find_power_watts(output, "CPU"),
        gpu_watts: find_power_watts(output, "GPU"),
        ane_watts: find_power_watts(output, "ANE"),
        combined_watts: find_power_watts(output, "Combined"),
    }
}

/// GPU residency, frequency and power from `powermetrics --samplers gpu_power`.
/// Idle residency is used when no active residency line is present.
pub fn parse_gpu_powermetrics(output: &str) -> GpuUtilization {
    let device = find_reading(output, &GPU_ACTIVE, Unit::Percent).or_else(|| {
        find_reading(output, &GPU_IDLE, Unit::Percent).map(|idle| (100.0 - idle).clamp(0.0, 100.0))
    });
    GpuUtilization {
        device_percent: device,
        render_percent: None,
        tiler_percent: None,
        active_frequency_mhz: find_reading(output, &GPU_FREQ, Unit::Megahertz),
        power_watts: find_power_watts(output, "GPU"),
    }
}

// ---------------------------------------------------------------------------
// ioreg
// ---------------------------------------------------------------------------

/// Collect every `"key"=number` / `"key" = number` pair in `s`, including pairs
/// nested inside `{...}` dictionaries on the same line. Keys may repeat.
pub fn scan_quoted_numbers(s: &str) -> Vec<(&str, f64)> {
    let bytes = s.as_bytes();
    let len = bytes.len();
    let mut out = Vec::new();
    let mut i = 0;

    while i < len {
        if bytes[i] != b'"' {
            i += 1;
            continue;
        }

        let key_start = i + 1;
        let mut key_end = key_start;
        while key_end < len && bytes[key_end] != b'"' {
            key_end += 1;
        }
        if key_end >= len {
            break;
        }

        let key = &s[key_start..key_end];
        let mut j = key_end + 1;
        while j < len && bytes[j] == b' ' {
            j += 1;
        }
        if j >= len || bytes[j] != b'=' {
            i = key_end + 1;
            continue;
        }
        j += 1;
        while j < len && bytes[j] == b' ' {
            j += 1;
        }

        let num_start = j;
        if j < len && bytes[j] == b'-' {
            j += 1;
        }
        while j < len && (bytes[j].is_ascii_digit() || bytes[j] == b'.') {
            j += 1;
        }
        if j > num_start
            && (j >= len || !bytes[j].is_ascii_alphanumeric())
            && let Ok(v) = s[num_start..j].parse::<f64>()
        {
            out.push((key, v));
        }
        i = j.max(key_end + 1);
    }
    out
}

fn first_quoted(text: &str, key: &str) -> Option<f64> {
    scan_quoted_numbers(text)
        .into_iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

/// Utilization from `ioreg -r -c IOAccelerator` performance statistics.
pub fn parse_ioreg_gpu(text: &str) -> GpuUtilization {
    GpuUtilization {
        device_percent: first_quoted(text, "Device Utilization %")
            .or_else(|| first_quoted(text, "GPU Utilization %")),
        render_percent: first_quoted(text, "Renderer Utilization %"),
        tiler_percent: first_quoted(text, "Tiler Utilization %"),
        active_frequency_mhz: None,
        power_watts: None,
    }
}

/// Cumulative bytes read and written, summed over every
/// `IOBlockStorageDriver` statistics dictionary.
pub fn parse_ioreg_block_storage(text: &str) -> Option<(u64, u64)> {
    let mut read = None::<u64>;
    let mut written = None::<u64>;
    for (key, v) in scan_quoted_numbers(text) {
        let v = v.max(0.0) as u64;
        match key {
            "Bytes (Read)" => read = Some(read.unwrap_or(0).saturating_add(v)),
            "Bytes (Write)" => written = Some(written.unwrap_or(0).saturating_add(v)),
            _ => {}
        }
    }
    Some((read?, written?))
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// `vm_stat` output: page size and page counts keyed by label.
#[derive(Debug, Clone, PartialEq)]
pub struct VmStat {
    pub page_size: u64,
    pub pages: HashMap<String, u64>,
}

impl VmStat {
    pub fn pages(&self, key: &str) -> u64 {
        self.pages.get(key).copied().unwrap_or(0)
    }

    /// File-backed, free and speculative pages, which the OS reclaims on demand.
    pub fn available_bytes(&self) -> u64 {
        (self.pages("File-backed pages") + self.pages("Pages free") + self.pages("Pages speculative"))
            * self.page_size
    }
}

pub fn parse_vm_stat(text: &str) -> Option<VmStat> {
    let mut page_size = 4096;
    let mut pages = HashMap::new();
    for line in text.lines() {
        if line.contains("page size of") {
            if let Some(ps) = line
                .split("page size of")
                .nth(1)
                .and_then(|s| s.split_whitespace().next())
                .and_then(|s| s.parse::<u64>().ok())
            {
                page_size = ps;
            }
            continue;
        }
        let Some((k, v)) = line.split_once(':') else {
            continue;
        };
        let cleaned: String = v.trim().trim_end_matches('.').replace(',', "");
        if let Ok(n) = cleaned.parse::<u64>() {
            pages.insert(k.trim().to_string(), n);
        }
    }
    (!pages.is_empty()).then_some(VmStat { page_size, pages })
}

/// `/proc/meminfo`: used is total minus `MemAvailable`.
pub fn parse_meminfo(text: &str) -> Option<MemoryUsage> {
    let mut total = None;
    let mut available = None;
    let mut free = None;
    for line in text.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let Some(kb) = rest
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<u64>().ok())
        else {
            continue;
        };
        match key {
            "MemTotal" => total = Some(kb * 1024),
            "MemAvailable" => available = Some(kb * 1024),
            "MemFree" => free = Some(kb * 1024),
            _ => {}
        }
    }
    let total = total.filter(|t| *t > 0)?;
    Some(MemoryUsage::from_total_available(total, available.or(free)?))
}

// ---------------------------------------------------------------------------
// CPU
// ---------------------------------------------------------------------------

/// Aggregate `cpu ` line of `/proc/stat`; idle plus iowait count as not busy.
pub fn parse_proc_stat_cpu(text: &str) -> Option<CpuTicks> {
    let rest = text.lines().find_map(|l| l.strip_prefix("cpu "))?;
    let parts: Vec<u64> = rest
        .split_whitespace()
        .filter_map(|s| s.parse::<u64>().ok())
        .collect();
    if parts.len() < 4 {
        return None;
    }
    // guest time is already included in user/nice
    let total = parts.iter().take(8).fold(0u64, |acc, v| acc.saturating_add(*v));
    let idle = parts[3].saturating_add(parts.get(4).copied().unwrap_or(0));
    Some(CpuTicks {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// `sysctl -n kern.cp_time`: user nice system idle intr.
pub fn parse_cp_time(text: &str) -> Option<CpuTicks> {
    let parts: Vec<u64> = text
        .split_whitespace()
        .filter_map(|s| s.parse::<u64>().ok())
        .collect();
    if parts.len() < 5 {
        return None;
    }
    let total = parts[..5].iter().fold(0u64, |acc, v| acc.saturating_add(*v));
    Some(CpuTicks {
        busy: total.saturating_sub(parts[3]),
        total,
    })
}

/// Sum of the `%cpu` column from `ps -A -o %cpu`.
pub fn parse_ps_cpu_sum(text: &str) -> Option<f64> {
    let values: Vec<f64> = text
        .lines()
        .filter_map(|l| l.trim().replace(',', ".").parse::<f64>().ok())
        .collect();
    (!values.is_empty()).then(|| values.iter().sum())
}

// ---------------------------------------------------------------------------
// Disk
// ---------------------------------------------------------------------------

/// Whole block devices only: partitions, loop, ram and mapper devices are skipped.
pub fn is_likely_disk_device(name: &str) -> bool {
    const VIRTUAL: [&str; 8] = ["loop", "ram", "dm-", "md", "zram", "sr", "fd", "nbd"];
    if VIRTUAL.iter().any(|p| name.starts_with(p)) {
        return false;
    }
    if name.starts_with("nvme") || name.starts_with("mmcblk") {
        return !name.contains('p');
    }
    !name.chars().last().is_some_and(|c| c.is_ascii_digit())
}

/// `/proc/diskstats`: sectors read and written over whole disks, in bytes.
pub fn parse_diskstats(text: &str) -> Option<(u64, u64)> {
    let mut read = 0u64;
    let mut written = 0u64;
    let mut disks = 0;
    for line in text.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 14 || !is_likely_disk_device(parts[2]) {
            continue;
        }
        let (Ok(r), Ok(w)) = (parts[5].parse::<u64>(), parts[9].parse::<u64>()) else {
            continue;
        };
        disks += 1;
        read = read.saturating_add(r.saturating_mul(512));
        written = written.saturating_add(w.saturating_mul(512));
    }
    (disks > 0).then_some((read, written))
}

/// `df -k /`: second line, 1K-blocks and available columns.
pub fn parse_df(text: &str) -> Option<DiskSpace> {
    let line = text.lines().filter(|l| !l.trim().is_empty()).nth(1)?;
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 5 {
        return None;
    }
    let total = parts[1].parse::<u64>().ok()? * 1024;
    let free = parts[3].parse::<u64>().ok()? * 1024;
    Some(DiskSpace { total, free })
}

static PAREN_BYTES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([\d,]+)\s+Bytes\)").unwrap());

/// Exact byte count from a human size such as `494.4 GB (494384795648 Bytes)`,
/// or a bare integer.
pub fn parse_byte_count(value: &str) -> Option<u64> {
    if let Some(caps) = PAREN_BYTES.captures(value) {
        return caps[1].replace(',', "").parse().ok();
    }
    value.trim().parse().ok()
}

/// `diskutil info <target>` as key/value pairs.
pub fn parse_diskutil_info(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .collect()
}

/// Capacity from `diskutil info /`. The largest free-space figure is used;
/// APFS reports purgeable space only in some of them.
pub fn diskutil_space(info: &HashMap<String, String>) -> Option<DiskSpace> {
    let total = ["Container Total Space", "Disk Size", "Volume Total Space", "Total Size"]
        .iter()
        .filter_map(|k| info.get(*k).and_then(|v| parse_byte_count(v)))
        .find(|v| *v > 0)?;
    let free = [
        "Volume Available Space",
        "Container Free Space",
        "Volume Free Space",
        "Free Space",
    ]
    .iter()
    .filter_map(|k| info.get(*k).and_then(|v| parse_byte_count(v)))
    .filter(|v| *v > 0)
    .max()?;
    Some(DiskSpace { total, free })
}

/// `disk3s1s1` → `disk3`.
pub fn whole_disk(device_identifier: &str) -> String {
    static WHOLE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(disk\d+)").unwrap());
    let cleaned = device_identifier.trim_start_matches("/dev/");
    WHOLE
        .captures(cleaned)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| cleaned.to_string())
}

fn as_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Value::String(s) => {
            let digits: String = s
                .replace(',', "")
                .chars()
                .skip_while(|c| !c.is_ascii_digit())
                .take_while(|c| c.is_ascii_digit())
                .collect();
            digits.parse().ok()
        }
        _ => None,
    }
}

/// Root volume capacity from `system_profiler SPStorageDataType -json`,
/// matched by volume UUID, then BSD name, then mount point `/`.
pub fn parse_storage_profile(
    json: &str,
    volume_uuid: Option<&str>,
    bsd_name: Option<&str>,
) -> Option<DiskSpace> {
    let doc: Value = serde_json::from_str(json).ok()?;
    let entries = doc.get("SPStorageDataType")?.as_array()?;
    let volumes: Vec<&Value> = entries
        .iter()
        .flat_map(|e| match e.get("volumes").and_then(Value::as_array) {
            Some(vols) => vols.iter().collect::<Vec<_>>(),
            None => vec![e],
        })
        .collect();

    fn field_eq(vol: &Value, field: &str, want: &str) -> bool {
        vol.get(field)
            .and_then(Value::as_str)
            .is_some_and(|v| v.eq_ignore_ascii_case(want))
    }
    let find = |field: &str, want: &str| volumes.iter().copied().find(|v| field_eq(v, field, want));
    let target = volume_uuid
        .and_then(|u| find("volume_uuid", u))
        .or_else(|| bsd_name.and_then(|b| find("bsd_name", b)))
        .or_else(|| find("mount_point", "/"))?;

    let size = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| target.get(*k).and_then(as_u64))
            .filter(|v| *v > 0)
    };
    Some(DiskSpace {
        total: size(&["size_in_bytes", "size"])?,
        free: size(&[
            "available_space_in_bytes",
            "free_space_in_bytes",
            "available",
            "free",
        ])?,
    })
}

/// Extract the JSON document from smartctl output, which may carry banner text.
pub fn extract_json_block(output: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str::<Value>(output.trim()) {
        return Some(v);
    }
    let start = output.find('{')?;
    let end = output.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&output[start..=end]).ok()
}

/// NVMe health figures from `smartctl -a -j`.
pub fn parse_smartctl(doc: &Value) -> SmartHealth {
    let log = doc
        .get("nvme_smart_health_information_log")
        .cloned()
        .unwrap_or(Value::Null);
    let at = |v: &Value, path: &[&str]| -> Option<u64> {
        let mut cur = v;
        for p in path {
            cur = cur.get(*p)?;
        }
        as_u64(cur)
    };

    let wear = at(&log, &["percentage_used"]).or_else(|| at(doc, &["endurance_used", "current_percent"]));
    let spare = at(&log, &["available_spare"])
        .or_else(|| at(doc, &["spare_available", "current_percent"]));
    SmartHealth {
        bytes_read: at(&log, &["data_units_read"]).map(|u| u.saturating_mul(512_000)),
        bytes_written: at(&log, &["data_units_written"]).map(|u| u.saturating_mul(512_000)),
        temperature_c: at(&log, &["temperature"])
            .or_else(|| at(doc, &["temperature", "current"]))
            .map(|t| t as f64),
        power_cycles: at(&log, &["power_cycles"]).or_else(|| at(doc, &["power_cycle_count"])),
        power_on_hours: at(&log, &["power_on_hours"])
            .or_else(|| at(doc, &["power_on_time", "hours"])),
        health_percent: wear.map(|w| 100u64.saturating_sub(w)).or(spare),
        available_spare_percent: spare,
        passed: doc
            .get("smart_status")
            .and_then(|s| s.get("passed"))
            .and_then(Value::as_bool),
    }
}

// ---------------------------------------------------------------------------
// GPU static info
// ---------------------------------------------------------------------------

/// Chip name from `system_profiler SPHardwareDataType -json`.
pub fn parse_hardware_model(json: &str) -> Option<String> {
    let doc: Value = serde_json::from_str(json).ok()?;
    let hw = doc.get("SPHardwareDataType")?.get(0)?;
    ["chip_type", "machine_model"]
        .iter()
        .find_map(|k| hw.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

/// GPU core count: the first key containing "core" that holds an integer,
/// found by a depth-first scan of `SPDisplaysDataType -json`.
pub fn parse_gpu_cores(json: &str) -> Option<u32> {
    fn scan(v: &Value) -> Option<u32> {
        match v {
            Value::Object(map) => {
                for (k, val) in map {
                    if k.to_ascii_lowercase().contains("core") {
                        let n = match val {
                            Value::Number(n) => n.as_u64(),
                            Value::String(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => {
                                s.parse().ok()
                            }
                            _ => None,
                        };
                        if let Some(n) = n {
                            return u32::try_from(n).ok();
                        }
                    }
                    if let Some(found) = scan(val) {
                        return Some(found);
                    }
                }
                None
            }
            Value::Array(items) => items.iter().find_map(scan),
            _ => None,
        }
    }
    let doc: Value = serde_json::from_str(json).ok()?;
    scan(doc.get("SPDisplaysDataType")?).filter(|c| *c > 0)
}

pub fn parse_gpu_static(hardware_json: Option<&str>, displays_json: Option<&str>) -> GpuStaticInfo {
    GpuStaticInfo {
        model: hardware_json.and_then(parse_hardware_model),
        cores: displays_json.and_then(parse_gpu_cores),
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// `/proc/net/dev`: receive bytes are the first field, transmit bytes the ninth.
pub fn parse_proc_net_dev(text: &str) -> Vec<InterfaceCounters> {
    text.lines()
        .skip(2)
        .filter_map(|line| {
            let (iface, stats) = line.split_once(':')?;
            let fields: Vec<u64> = stats
                .split_whitespace()
                .filter_map(|s| s.parse::<u64>().ok())
                .collect();
            if fields.len() < 16 {
                return None;
            }
            Some(InterfaceCounters {
                name: iface.trim().to_string(),
                rx_bytes: fields[0],
                tx_bytes: fields[8],
            })
        })
        .collect()
}

/// `netstat -ibn`: one `<Link#n>` row per interface. Byte columns are counted
/// from the end because the address column is blank for some interfaces.
pub fn parse_netstat_ibn(text: &str) -> Vec<InterfaceCounters> {
    let mut out: Vec<InterfaceCounters> = Vec::new();
    for line in text.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 10 || cols[0] == "Name" || !cols[2].starts_with("<Link#") {
            continue;
        }
        let n = cols.len();
        let (Ok(rx), Ok(tx)) = (cols[n - 5].parse::<u64>(), cols[n - 2].parse::<u64>()) else {
            continue;
        };
        let name = cols[0].trim_end_matches('*').to_string();
        if out.iter().any(|c| c.name == name) {
            continue;
        }
        out.push(InterfaceCounters {
            name,
            rx_bytes: rx,
            tx_bytes: tx,
        });
    }
    out
}

// ---------------------------------------------------------------------------
// Battery, processes
// ---------------------------------------------------------------------------

static PMSET_PERCENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)%").unwrap());

/// `pmset -g batt`.
pub fn parse_pmset(text: &str) -> (Option<f64>, Option<BatteryState>) {
    let lower = text.to_lowercase();
    let percent = PMSET_PERCENT
        .captures(&lower)
        .and_then(|c| c[1].parse::<f64>().ok());
    let state = if lower.contains("discharging") || lower.contains("battery power") {
        Some(BatteryState::Discharging)
    } else if lower.contains("charging") || lower.contains("ac power") {
        Some(BatteryState::Charging)
    } else if lower.contains("charged") {
        Some(BatteryState::Charged)
    } else {
        None
    };
    (percent, state)
}

/// `/sys/class/power_supply/BAT*/status` values.
pub fn parse_sysfs_battery_status(status: &str) -> Option<BatteryState> {
    match status.trim().to_ascii_lowercase().as_str() {
        "charging" => Some(BatteryState::Charging),
        "discharging" | "not charging" => Some(BatteryState::Discharging),
        "full" => Some(BatteryState::Charged),
        _ => None,
    }
}

/// `ps -Ao pid=,rss=,pcpu=,comm=`; rss is in KiB.
pub fn parse_ps_processes(text: &str) -> Vec<ProcessInfo> {
    text.lines()
        .filter_map(|line| {
            let mut it = line.split_whitespace();
            let pid = it.next()?.parse::<u32>().ok()?;
            let rss_kb = it.next()?.parse::<u64>().ok()?;
            let cpu = it.next()?.replace(',', ".").parse::<f64>().ok()?;
            let comm: Vec<&str> = it.collect();
            if comm.is_empty() {
                return None;
            }
            let full = comm.join(" ");
            let name = full.rsplit('/').next().unwrap_or(&full).to_string();
            Some(ProcessInfo {
                pid,
                name,
                rss_bytes: rss_kb * 1024,
                cpu_percent: cpu,
            })
        })
        .collect()
}
