//! TUI application state and event loop.
//!
//! The dashboard is one more consumer on the broadcast hub: it keeps a rolling
//! history of every series whichever chart is showing, so switching charts
//! never shows a gap. Slow readings and the privilege workflow run on
//! background threads so the UI never blocks.

use std::collections::VecDeque;
use std::io;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::thread;
use std::time::{Duration, Instant};

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::prelude::*;

use livestat_core::{
    BootstrapEvent, MAX_INTERVAL_MS, MIN_INTERVAL_MS, PrivilegeState, Readings, Sample,
    SampleConsumer, SubscriptionHandle, TelemetryEngine,
};

// ---------------------------------------------------------------------------
// ChartMode
// ---------------------------------------------------------------------------

/// Which history the chart shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChartMode {
    #[default]
    Cpu,
    Gpu,
    Memory,
    Disk,
    Network,
}

impl ChartMode {
    pub fn next(self) -> Self {
        match self {
            Self::Cpu => Self::Gpu,
            Self::Gpu => Self::Memory,
            Self::Memory => Self::Disk,
            Self::Disk => Self::Network,
            Self::Network => Self::Cpu,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::Gpu => "GPU",
            Self::Memory => "Memory",
            Self::Disk => "Disk I/O",
            Self::Network => "Network",
        }
    }

    pub fn is_rate(self) -> bool {
        matches!(self, Self::Disk | Self::Network)
    }

    /// Named series for this chart.
    pub fn series(self, h: &History) -> Vec<(&'static str, &VecDeque<Option<f64>>)> {
        match self {
            Self::Cpu => vec![("cpu", &h.cpu)],
            Self::Gpu => vec![("device", &h.gpu_device), ("render", &h.gpu_render)],
            Self::Memory => vec![("used", &h.ram)],
            Self::Disk => vec![("read", &h.disk_read), ("write", &h.disk_write)],
            Self::Network => vec![("down", &h.net_down), ("up", &h.net_up)],
        }
    }

    /// Y axis bounds given the largest value on screen.
    pub fn y_bounds(self, max_val: f64) -> (f64, f64) {
        if self.is_rate() {
            (0.0, (max_val * 1.2).max(1024.0))
        } else {
            (0.0, 100.0)
        }
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Samples retained per series.
pub const MAX_HISTORY: usize = 120;

/// Intervals `+` and `-` step through.
pub const INTERVAL_STEPS: [u64; 9] = [200, 250, 500, 750, 1000, 1500, 2000, 3000, 5000];

/// How long slow readings stay on screen before a refresh.
const READINGS_REFRESH: Duration = Duration::from_secs(5);

/// Next step above (`up`) or below the current interval, within bounds.
pub fn next_interval(current_ms: u64, up: bool) -> u64 {
    let next = if up {
        INTERVAL_STEPS.iter().copied().find(|&s| s > current_ms)
    } else {
        INTERVAL_STEPS.iter().rev().copied().find(|&s| s < current_ms)
    };
    next.unwrap_or(if up { MAX_INTERVAL_MS } else { MIN_INTERVAL_MS })
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Rolling window of every series. Missing values are kept as gaps.
#[derive(Debug, Clone, Default)]
pub struct History {
    pub cpu: VecDeque<Option<f64>>,
    pub gpu_device: VecDeque<Option<f64>>,
    pub gpu_render: VecDeque<Option<f64>>,
    pub ram: VecDeque<Option<f64>>,
    pub disk_read: VecDeque<Option<f64>>,
    pub disk_write: VecDeque<Option<f64>>,
    pub net_down: VecDeque<Option<f64>>,
    pub net_up: VecDeque<Option<f64>>,
    pub latest: Option<Sample>,
}

fn push(series: &mut VecDeque<Option<f64>>, value: Option<f64>) {
    series.push_back(value);
    if series.len() > MAX_HISTORY {
        series.pop_front();
    }
}

impl History {
    pub fn record(&mut self, s: &Sample) {
        push(&mut self.cpu, s.cpu_percent);
        push(&mut self.gpu_device, s.gpu_device_percent);
        push(&mut self.gpu_render, s.gpu_render_percent);
        push(&mut self.ram, s.ram_percent);
        push(&mut self.disk_read, s.disk_read_bps);
        push(&mut self.disk_write, s.disk_write_bps);
        push(&mut self.net_down, s.net_down_bps);
        push(&mut self.net_up, s.net_up_bps);
        self.latest = Some(s.clone());
    }
}

/// Hub consumer feeding [`History`].
#[derive(Default)]
pub struct HistoryRecorder {
    history: Mutex<History>,
}

impl HistoryRecorder {
    pub fn snapshot(&self) -> History {
        self.history.lock().unwrap().clone()
    }
}

impl SampleConsumer for HistoryRecorder {
    fn on_sample(&self, sample: &Sample) {
        self.history.lock().unwrap().record(sample);
    }
}

// ---------------------------------------------------------------------------
// App
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SharedState {
    readings: Option<Readings>,
    readings_at: Option<Instant>,
    privilege_message: Option<String>,
}

/// Everything one frame draws, captured once.
pub struct Snapshot {
    pub history: History,
    pub readings: Option<Readings>,
    pub loading_readings: bool,
    pub privilege_state: PrivilegeState,
    pub privilege_message: Option<String>,
    pub interval_ms: u64,
    pub sampling: bool,
}

pub struct App {
    engine: Arc<TelemetryEngine>,
    recorder: Arc<HistoryRecorder>,
    subscription: SubscriptionHandle,
    running: bool,
    chart_mode: ChartMode,
    shared: Arc<Mutex<SharedState>>,
    readings_flag: Arc<AtomicBool>,
}

impl App {
    pub fn new(engine: Arc<TelemetryEngine>) -> Self {
        let recorder = Arc::new(HistoryRecorder::default());
        let subscription = engine.subscribe(&recorder);
        Self {
            engine,
            recorder,
            subscription,
            running: true,
            chart_mode: ChartMode::default(),
            shared: Arc::new(Mutex::new(SharedState::default())),
            readings_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn run(&mut self) -> io::Result<()> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        // Restore the terminal before the panic message is printed.
        let original_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let _ = disable_raw_mode();
            let _ = execute!(io::stdout(), LeaveAlternateScreen, crossterm::cursor::Show);
            original_hook(info);
        }));

        self.engine.start();
        let result = self.run_loop(&mut terminal);
        self.engine.shutdown();

        let _ = std::panic::take_hook();
        disable_raw_mode()?;
        execute!(
            terminal.backend_mut(),
            LeaveAlternateScreen,
            crossterm::cursor::Show
        )?;

        result
    }

    fn run_loop(
        &mut self,
        terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    ) -> io::Result<()> {
        self.kick_readings();

        while self.running {
            let snapshot = self.snapshot();
            terminal.draw(|f| super::ui::draw(f, self, &snapshot))?;

            if event::poll(Duration::from_millis(50))?
                && let Event::Key(key) = event::read()?
                && key.kind == KeyEventKind::Press
            {
                self.handle_key(key.code);
            }

            let stale = self
                .shared
                .lock()
                .unwrap()
                .readings_at
                .is_none_or(|at| at.elapsed() >= READINGS_REFRESH);
            if stale {
                self.kick_readings();
            }
        }

        Ok(())
    }

    fn handle_key(&mut self, key: KeyCode) {
        match key {
            KeyCode::Char('q') | KeyCode::Esc => self.running = false,
            KeyCode::Char('+') | KeyCode::Char('=') => self.step_interval(true),
            KeyCode::Char('-') | KeyCode::Char('_') => self.step_interval(false),
            KeyCode::Tab | KeyCode::Char('c') => self.chart_mode = self.chart_mode.next(),
            KeyCode::Char('r') => {
                self.shared.lock().unwrap().readings_at = None;
            }
            KeyCode::Char('p') => self.enable_privileges(),
            _ => {}
        }
    }

    fn step_interval(&self, up: bool) {
        let next = next_interval(self.engine.interval_ms(), up);
        let applied = self.engine.set_interval(next);
        log::debug!("interval set to {applied}ms");
    }

    /// Refresh slow readings on a worker unless one is already running.
    fn kick_readings(&self) {
        if self.readings_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = Arc::clone(&self.engine);
        let shared = Arc::clone(&self.shared);
        let flag = Arc::clone(&self.readings_flag);

        thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| engine.readings()));
            if let Ok(mut s) = shared.lock() {
                if let Ok(readings) = result {
                    s.readings = Some(readings);
                }
                s.readings_at = Some(Instant::now());
            }
            flag.store(false, Ordering::SeqCst);
        });
    }

    /// Start or join the workflow and mirror its events into the status line.
    fn enable_privileges(&self) {
        let ticket = self.engine.trigger_privilege_bootstrap();
        let shared = Arc::clone(&self.shared);
        shared.lock().unwrap().privilege_message = Some("Starting…".into());

        thread::spawn(move || {
            for event in ticket.events.iter() {
                let (message, done) = match event {
                    BootstrapEvent::Status { step, message } => (format!("{step}: {message}"), false),
                    BootstrapEvent::Finished(Ok(message)) => (message, true),
                    BootstrapEvent::Finished(Err(e)) => (e.to_string(), true),
                };
                if let Ok(mut s) = shared.lock() {
                    s.privilege_message = Some(message);
                    if done {
                        // re-read privileged values on the next frame
                        s.readings_at = None;
                    }
                }
                if done {
                    break;
                }
            }
        });
    }

    pub fn chart_mode(&self) -> ChartMode {
        self.chart_mode
    }

    /// Capture all shared state in one lock per source for one UI frame.
    pub fn snapshot(&self) -> Snapshot {
        let s = match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Snapshot {
            history: self.recorder.snapshot(),
            readings: s.readings.clone(),
            loading_readings: self.readings_flag.load(Ordering::SeqCst),
            privilege_state: self.engine.privilege_state(),
            privilege_message: s.privilege_message.clone(),
            interval_ms: self.engine.interval_ms(),
            sampling: self.engine.is_active(),
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.engine.unsubscribe(self.subscription);
    }
}
