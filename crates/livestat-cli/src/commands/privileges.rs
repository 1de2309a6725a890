use livestat_core::{BootstrapEvent, EngineConfig, SUDOERS_FILE, TelemetryEngine};

pub fn run(config: EngineConfig) {
    let engine = TelemetryEngine::new(config);

    println!("Enabling privileged access ({SUDOERS_FILE})");
    println!("An administrator prompt may appear.");
    println!();

    let ticket = engine.trigger_privilege_bootstrap();
    log::debug!("bootstrap run {}", ticket.run_id);

    let mut outcome = None;
    for event in ticket.events.iter() {
        match event {
            BootstrapEvent::Status { step, message } => println!("  [{step}] {message}"),
            BootstrapEvent::Finished(result) => {
                outcome = Some(result);
                break;
            }
        }
    }
    let outcome = match outcome {
        Some(result) => result,
        None => ticket.wait(),
    };

    println!();
    match outcome {
        Ok(message) => println!("✓ {message}"),
        Err(e) => {
            eprintln!("✗ {e}");
            std::process::exit(1);
        }
    }
}
