//! Human-readable values for terminal output.

use livestat_core::Sample;

const BYTE_UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

pub fn bytes(value: u64) -> String {
    let mut v = value as f64;
    let mut idx = 0usize;
    while v >= 1024.0 && idx < BYTE_UNITS.len() - 1 {
        v /= 1024.0;
        idx += 1;
    }
    if idx == 0 {
        format!("{value} B")
    } else {
        format!("{v:.1} {}", BYTE_UNITS[idx])
    }
}

/// Bytes per second.
pub fn rate(bps: f64) -> String {
    if !bps.is_finite() || bps <= 0.0 {
        return "0 B/s".to_string();
    }
    format!("{}/s", bytes(bps.round() as u64))
}

pub fn percent(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.1}%"),
        None => "--".to_string(),
    }
}

pub fn watts(value: f64) -> String {
    if value > 0.0 && value < 0.01 {
        "<0.01 W".to_string()
    } else {
        format!("{value:.2} W")
    }
}

pub fn celsius(value: f64) -> String {
    format!("{value:.1} °C")
}

/// `3d 4h 12m`, dropping leading zero units.
pub fn uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

/// UTC wall-clock time of day with milliseconds.
pub fn clock_time(unix_ms: u64) -> String {
    let ms = unix_ms % 1000;
    let secs = (unix_ms / 1000) % 86_400;
    format!(
        "{:02}:{:02}:{:02}.{ms:03}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}

fn opt_rate(value: Option<f64>) -> String {
    value.map(rate).unwrap_or_else(|| "--".to_string())
}

/// One line per sample, for `watch`.
pub fn sample_line(s: &Sample) -> String {
    let mut parts = vec![
        format!("{} #{}", clock_time(s.timestamp_ms), s.sequence),
        format!("cpu {}", percent(s.cpu_percent)),
    ];
    if s.gpu_device_percent.is_some() || s.gpu_render_percent.is_some() {
        parts.push(format!(
            "gpu {} (render {})",
            percent(s.gpu_device_percent),
            percent(s.gpu_render_percent)
        ));
    }
    let mut ram = format!("ram {}", percent(s.ram_percent));
    if let (Some(used), Some(total)) = (s.ram_used, s.ram_total) {
        ram.push_str(&format!(" ({} / {})", bytes(used), bytes(total)));
    }
    parts.push(ram);
    parts.push(format!(
        "disk r {} w {}",
        opt_rate(s.disk_read_bps),
        opt_rate(s.disk_write_bps)
    ));
    parts.push(format!(
        "net {} ↓ {} ↑ {}",
        s.net_interface.as_deref().unwrap_or("-"),
        opt_rate(s.net_down_bps),
        opt_rate(s.net_up_bps)
    ));
    parts.join("  ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_scale_binary() {
        assert_eq!(bytes(0), "0 B");
        assert_eq!(bytes(1023), "1023 B");
        assert_eq!(bytes(1536), "1.5 KiB");
        assert_eq!(bytes(16 * 1024 * 1024 * 1024), "16.0 GiB");
    }

    #[test]
    fn rate_handles_zero_and_garbage() {
        assert_eq!(rate(0.0), "0 B/s");
        assert_eq!(rate(f64::NAN), "0 B/s");
        assert_eq!(rate(-5.0), "0 B/s");
        assert_eq!(rate(2048.0), "2.0 KiB/s");
    }

    #[test]
    fn watts_small_values() {
        assert_eq!(watts(0.0), "0.00 W");
        assert_eq!(watts(0.004), "<0.01 W");
        assert_eq!(watts(3.256), "3.26 W");
    }

    #[test]
    fn uptime_drops_leading_units() {
        assert_eq!(uptime(59), "0m");
        assert_eq!(uptime(3 * 3600 + 120), "3h 2m");
        assert_eq!(uptime(2 * 86_400 + 3600 + 60), "2d 1h 1m");
    }

    #[test]
    fn clock_time_of_day() {
        assert_eq!(clock_time(1_700_000_000_123), "22:13:20.123");
    }

    #[test]
    fn sample_line_marks_missing_fields() {
        let s = Sample {
            timestamp_ms: 1_700_000_000_000,
            sequence: 7,
            cpu_percent: Some(12.34),
            net_down_bps: Some(1024.0),
            net_interface: Some("en0".into()),
            ..Sample::default()
        };
        let line = sample_line(&s);
        assert!(line.contains("#7"));
        assert!(line.contains("cpu 12.3%"));
        assert!(line.contains("ram --"));
        assert!(!line.contains("gpu"));
        assert!(line.contains("net en0 ↓ 1.0 KiB/s ↑ --"));
    }
}
