use std::sync::Arc;

use livestat_core::{EngineConfig, TelemetryEngine};

pub fn run(config: EngineConfig) {
    let engine = Arc::new(TelemetryEngine::new(config));
    let mut app = crate::tui::app::App::new(engine);
    if let Err(e) = app.run() {
        eprintln!("TUI error: {e}");
        std::process::exit(1);
    }
}
