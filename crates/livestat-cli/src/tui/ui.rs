//! TUI rendering.
//!
//! ┌──────────────────────────────────────────────┐
//! │  livestat   500ms   #1234   privileges: on   │
//! ├─────────────────────┬────────────────────────┤
//! │  CPU   ████░░ 42%   │  ╭ CPU history         │
//! │  GPU   ██░░░░ 18%   │  │  ~~~~~~~~~~         │
//! │  RAM   █████░ 77%   │  ╰──────────────────── │
//! │  Disk  ███░░░ 51%   │                        │
//! ├─────────────────────┴────────────────────────┤
//! │  battery · thermal · fan · power · processes │
//! ├──────────────────────────────────────────────┤
//! │  +/- interval   tab: chart   p: privileges   │
//! └──────────────────────────────────────────────┘

use super::app::{App, ChartMode, Snapshot};
use crate::format;
use livestat_core::PrivilegeState;
use ratatui::{prelude::*, widgets::*};

pub fn draw(f: &mut Frame, app: &App, snap: &Snapshot) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // title
            Constraint::Min(10),   // main
            Constraint::Length(8), // readings
            Constraint::Length(1), // keys
        ])
        .split(f.area());

    draw_title(f, rows[0], snap);
    draw_main(f, rows[1], app, snap);
    draw_readings(f, rows[2], snap);
    draw_keys(f, rows[3]);
}

fn privilege_label(state: &PrivilegeState) -> (&'static str, Color) {
    match state {
        PrivilegeState::Enabled => ("on", Color::Green),
        PrivilegeState::Failed(_) => ("failed", Color::Red),
        PrivilegeState::Unchecked => ("off", Color::DarkGray),
        _ => ("working", Color::Yellow),
    }
}

fn draw_title(f: &mut Frame, area: Rect, snap: &Snapshot) {
    let seq = snap.history.latest.as_ref().map_or(0, |s| s.sequence);
    let stalled = if snap.sampling { "" } else { "  stalled" };
    let (privs, color) = privilege_label(&snap.privilege_state);

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan))
        .title(Line::from(vec![
            Span::styled(" livestat ", Style::default().bold().fg(Color::Cyan)),
            Span::styled(
                format!("  {}ms  #{seq}{stalled}  ", snap.interval_ms),
                Style::default().fg(Color::DarkGray),
            ),
            Span::raw("privileges: "),
            Span::styled(format!("{privs} "), Style::default().bold().fg(color)),
        ]));

    let status = snap.privilege_message.as_deref().unwrap_or("");
    let p = Paragraph::new(status)
        .style(Style::default().fg(Color::DarkGray))
        .block(block);
    f.render_widget(p, area);
}

fn draw_main(f: &mut Frame, area: Rect, app: &App, snap: &Snapshot) {
    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(area);

    draw_gauges(f, cols[0], snap);
    draw_chart(f, cols[1], app.chart_mode(), snap);
}

fn gauge_color(pct: f64) -> Color {
    if pct >= 85.0 {
        Color::Red
    } else if pct >= 60.0 {
        Color::Yellow
    } else {
        Color::Green
    }
}

fn draw_gauges(f: &mut Frame, area: Rect, snap: &Snapshot) {
    let latest = snap.history.latest.as_ref();
    let disk_pct = snap
        .readings
        .as_ref()
        .and_then(|r| r.disk_usage.value.as_ref())
        .map(|d| d.percent_used);

    let rows: [(&str, Option<f64>, String); 4] = [
        ("CPU", latest.and_then(|s| s.cpu_percent), String::new()),
        (
            "GPU",
            latest.and_then(|s| s.gpu_device_percent),
            latest
                .and_then(|s| s.gpu_render_percent)
                .map(|r| format!("render {r:.0}%"))
                .unwrap_or_default(),
        ),
        (
            "RAM",
            latest.and_then(|s| s.ram_percent),
            match latest.and_then(|s| s.ram_used.zip(s.ram_total)) {
                Some((used, total)) => format!("{} / {}", format::bytes(used), format::bytes(total)),
                None => String::new(),
            },
        ),
        ("Disk", disk_pct, String::new()),
    ];

    let block = Block::default().borders(Borders::ALL).title(" Now ");
    let inner = block.inner(area);
    f.render_widget(block, area);

    let slots = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(2); 5])
        .split(inner);

    for (i, (label, value, detail)) in rows.iter().enumerate() {
        let (ratio, text, color) = match value {
            Some(v) => (
                (v / 100.0).clamp(0.0, 1.0),
                format!("{label} {v:.1}% {detail}"),
                gauge_color(*v),
            ),
            None => (0.0, format!("{label} --"), Color::DarkGray),
        };
        let gauge = Gauge::default()
            .gauge_style(Style::default().fg(color))
            .ratio(ratio)
            .label(text);
        f.render_widget(gauge, slots[i]);
    }

    let net = latest.map_or_else(
        || "Net --".to_string(),
        |s| {
            format!(
                "{} ↓ {} ↑ {}",
                s.net_interface.as_deref().unwrap_or("net"),
                s.net_down_bps.map(format::rate).unwrap_or_else(|| "--".into()),
                s.net_up_bps.map(format::rate).unwrap_or_else(|| "--".into())
            )
        },
    );
    f.render_widget(Paragraph::new(net), slots[4]);
}

fn draw_chart(f: &mut Frame, area: Rect, mode: ChartMode, snap: &Snapshot) {
    const COLORS: [Color; 2] = [Color::Cyan, Color::Magenta];

    let series = mode.series(&snap.history);
    let points: Vec<Vec<(f64, f64)>> = series
        .iter()
        .map(|(_, values)| {
            values
                .iter()
                .enumerate()
                .filter_map(|(i, v)| v.map(|v| (i as f64, v)))
                .collect()
        })
        .collect();

    if points.iter().all(Vec::is_empty) {
        let block = Block::default()
            .borders(Borders::ALL)
            .title(format!(" {} ", mode.label()));
        let p = Paragraph::new("No data from this source yet")
            .style(Style::default().fg(Color::DarkGray))
            .block(block);
        f.render_widget(p, area);
        return;
    }

    let max_val = points
        .iter()
        .flatten()
        .map(|&(_, v)| v)
        .fold(0.0_f64, f64::max);
    let (y_min, y_max) = mode.y_bounds(max_val);
    let render = |v: f64| {
        if mode.is_rate() {
            format::rate(v)
        } else {
            format!("{v:.0}%")
        }
    };

    let datasets: Vec<Dataset> = series
        .iter()
        .zip(&points)
        .enumerate()
        .map(|(i, ((name, _), data))| {
            let latest = data.last().map(|&(_, v)| render(v)).unwrap_or_default();
            Dataset::default()
                .name(format!("{name} {latest}"))
                .marker(symbols::Marker::Braille)
                .style(Style::default().fg(COLORS[i % COLORS.len()]))
                .data(data)
        })
        .collect();

    let x_max = (snap.history.cpu.len() as f64).max(10.0);
    let chart = Chart::new(datasets)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!(" {} (tab to switch) ", mode.label())),
        )
        .x_axis(Axis::default().bounds([0.0, x_max]))
        .y_axis(Axis::default().bounds([y_min, y_max]).labels(vec![
            Line::from(render(y_min)),
            Line::from(render(y_max)),
        ]));

    f.render_widget(chart, area);
}

fn draw_readings(f: &mut Frame, area: Rect, snap: &Snapshot) {
    let title = if snap.loading_readings {
        " Readings ⟳ "
    } else {
        " Readings "
    };
    let block = Block::default().borders(Borders::ALL).title(title);

    let Some(r) = &snap.readings else {
        let p = Paragraph::new("Loading…")
            .style(Style::default().fg(Color::DarkGray))
            .block(block);
        f.render_widget(p, area);
        return;
    };

    let dim = Style::default().fg(Color::DarkGray);
    let or_dash = |text: Option<String>| text.unwrap_or_else(|| "--".into());

    let battery = or_dash(r.battery.value.map(|b| match b.state {
        Some(state) => format!("{} {state}", format::percent(b.percent)),
        None => format::percent(b.percent),
    }));
    let thermal = or_dash(r.thermal.value.and_then(|t| t.cpu_c.or(t.gpu_c)).map(format::celsius));
    let fan = or_dash(r.fan.value.map(|f| format!("{:.0} rpm", f.rpm)));
    let power = or_dash(
        r.power
            .value
            .and_then(|p| p.combined_watts.or(p.cpu_watts))
            .map(format::watts),
    );
    let uptime = or_dash(r.load.uptime_secs.map(format::uptime));
    let load = or_dash(r.load.load_1m.map(|l| format!("{l:.2}")));
    let top = r
        .processes
        .value
        .as_ref()
        .map(|p| {
            p.by_cpu
                .iter()
                .take(3)
                .map(|proc| format!("{} {:.0}%", proc.name, proc.cpu_percent))
                .collect::<Vec<_>>()
                .join("  ")
        })
        .unwrap_or_else(|| "--".into());

    let pair = |label: &'static str, value: String| {
        vec![Span::styled(format!("{label:<9}"), dim), Span::raw(format!("{value:<18}"))]
    };

    let lines = vec![
        Line::from([pair("Battery", battery), pair("Thermal", thermal)].concat()),
        Line::from([pair("Fan", fan), pair("Power", power)].concat()),
        Line::from([pair("Uptime", uptime), pair("Load", load)].concat()),
        Line::from(pair("Top CPU", top)),
    ];
    let p = Paragraph::new(lines).block(block);
    f.render_widget(p, area);
}

fn draw_keys(f: &mut Frame, area: Rect) {
    let bar = Paragraph::new(" +/- interval   tab: chart   r: refresh readings   p: enable privileges   q: quit")
        .style(Style::default().bg(Color::DarkGray).fg(Color::White));
    f.render_widget(bar, area);
}
