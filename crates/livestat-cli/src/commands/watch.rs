use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use livestat_core::{EngineConfig, Sample, TelemetryEngine};

pub fn run(config: EngineConfig, json: bool, count: u64) {
    let engine = TelemetryEngine::new(config);

    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        eprintln!("Error: cannot install Ctrl-C handler: {e}");
        std::process::exit(1);
    }

    // Print on this thread, not the tick thread.
    let (tx, rx) = mpsc::channel::<Sample>();
    let tx = Mutex::new(tx);
    let forward = Arc::new(move |s: &Sample| {
        let _ = tx.lock().unwrap().send(s.clone());
    });
    let _subscription = engine.subscribe(&forward);
    engine.start();

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut printed = 0u64;

    while !stop.load(Ordering::SeqCst) {
        let sample = match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(s) => s,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let line = if json {
            serde_json::to_string(&sample).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
        } else {
            crate::format::sample_line(&sample)
        };
        if writeln!(out, "{line}").is_err() {
            break; // Broken pipe
        }
        let _ = out.flush();

        printed += 1;
        if count > 0 && printed >= count {
            break;
        }
    }

    engine.shutdown();
}
