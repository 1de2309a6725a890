use std::time::Duration;

use livestat_core::{EngineConfig, ProbeResult, Readings, Sample, TelemetryEngine};

use crate::format;

pub fn run(config: EngineConfig, json: bool, settle_ms: u64) {
    let engine = TelemetryEngine::new(config);

    // Rates need two counter readings, and tool-backed counters land one
    // tick after they are asked for.
    for tick in 0..3 {
        if tick > 0 {
            std::thread::sleep(Duration::from_millis(settle_ms.max(1)));
        }
        if let Err(e) = engine.sample_now() {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
    let Some(sample) = engine.latest() else {
        eprintln!("Error: no sample was published");
        std::process::exit(1);
    };
    let readings = engine.readings();

    if json {
        let doc = serde_json::json!({
            "sample": sample.as_ref(),
            "readings": readings,
        });
        match serde_json::to_string_pretty(&doc) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    print_sample(&sample);
    println!();
    print_readings(&readings);
}

fn print_sample(s: &Sample) {
    println!("Sample #{} at {} UTC", s.sequence, format::clock_time(s.timestamp_ms));
    println!("  CPU:        {}", format::percent(s.cpu_percent));
    println!(
        "  GPU:        {} (render {}, tiler {})",
        format::percent(s.gpu_device_percent),
        format::percent(s.gpu_render_percent),
        format::percent(s.gpu_tiler_percent)
    );
    match (s.ram_used, s.ram_total) {
        (Some(used), Some(total)) => println!(
            "  Memory:     {} ({} of {})",
            format::percent(s.ram_percent),
            format::bytes(used),
            format::bytes(total)
        ),
        _ => println!("  Memory:     --"),
    }
    println!(
        "  Disk I/O:   read {}  write {}",
        s.disk_read_bps.map(format::rate).unwrap_or_else(|| "--".into()),
        s.disk_write_bps.map(format::rate).unwrap_or_else(|| "--".into())
    );
    println!(
        "  Network:    {} down {}  up {}",
        s.net_interface.as_deref().unwrap_or("-"),
        s.net_down_bps.map(format::rate).unwrap_or_else(|| "--".into()),
        s.net_up_bps.map(format::rate).unwrap_or_else(|| "--".into())
    );
}

fn line<T>(label: &str, result: &ProbeResult<T>, render: impl FnOnce(&T) -> String) {
    match (&result.value, &result.diagnostic) {
        (Some(v), _) => println!("  {label:<12}{}", render(v)),
        (None, Some(why)) => println!("  {label:<12}unavailable ({why})"),
        (None, None) => println!("  {label:<12}unavailable"),
    }
}

fn print_readings(r: &Readings) {
    println!("Readings");
    line("Disk:", &r.disk_usage, |d| {
        format!(
            "{:.1}% used, {} free of {}",
            d.percent_used,
            format::bytes(d.free),
            format::bytes(d.total)
        )
    });
    line("Volume:", &r.disk_meta, |m| {
        let mut text = m.volume_name.clone().unwrap_or_else(|| "?".into());
        if let Some(status) = &m.smart_status {
            text.push_str(&format!(", SMART {status}"));
        }
        if let Some(t) = m.smart.as_ref().and_then(|s| s.temperature_c) {
            text.push_str(&format!(", {}", format::celsius(t)));
        }
        text
    });
    line("GPU model:", &r.gpu_static, |g| {
        match (&g.model, g.cores) {
            (Some(model), Some(cores)) => format!("{model} ({cores} cores)"),
            (Some(model), None) => model.clone(),
            (None, Some(cores)) => format!("{cores} cores"),
            (None, None) => "?".into(),
        }
    });
    line("Battery:", &r.battery, |b| {
        let pct = format::percent(b.percent);
        match b.state {
            Some(state) => format!("{pct}, {state}"),
            None => pct,
        }
    });
    line("Thermal:", &r.thermal, |t| {
        let cpu = t.cpu_c.map(format::celsius).unwrap_or_else(|| "--".into());
        let gpu = t.gpu_c.map(format::celsius).unwrap_or_else(|| "--".into());
        format!("cpu {cpu}  gpu {gpu}")
    });
    line("Fan:", &r.fan, |f| match f.max_rpm {
        Some(max) => format!("{:.0} rpm of {max:.0}", f.rpm),
        None => format!("{:.0} rpm", f.rpm),
    });
    line("Power:", &r.power, |p| {
        [
            ("cpu", p.cpu_watts),
            ("gpu", p.gpu_watts),
            ("ane", p.ane_watts),
            ("total", p.combined_watts),
        ]
        .iter()
        .filter_map(|(name, w)| w.map(|w| format!("{name} {}", format::watts(w))))
        .collect::<Vec<_>>()
        .join("  ")
    });
    line("Top memory:", &r.processes, |p| {
        p.by_memory
            .iter()
            .take(3)
            .map(|proc| format!("{} {}", proc.name, format::bytes(proc.rss_bytes)))
            .collect::<Vec<_>>()
            .join(", ")
    });
    line("Top CPU:", &r.processes, |p| {
        p.by_cpu
            .iter()
            .take(3)
            .map(|proc| format!("{} {:.1}%", proc.name, proc.cpu_percent))
            .collect::<Vec<_>>()
            .join(", ")
    });

    let load = &r.load;
    if let Some(up) = load.uptime_secs {
        println!("  {:<12}{}", "Uptime:", format::uptime(up));
    }
    if let (Some(a), Some(b), Some(c)) = (load.load_1m, load.load_5m, load.load_15m) {
        println!("  {:<12}{a:.2} {b:.2} {c:.2}", "Load:");
    }
}
