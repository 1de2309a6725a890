use livestat_core::{AttemptOutcome, EngineConfig, RESOLVABLE_METRICS, TelemetryEngine};

pub fn run(config: EngineConfig, metric: Option<&str>, json: bool) {
    let Some(metric) = metric else {
        println!("Metrics that can be probed:");
        for name in RESOLVABLE_METRICS {
            println!("  {name}");
        }
        return;
    };

    let engine = TelemetryEngine::new(config);
    let metric = metric.to_lowercase();
    let Some(resolution) = engine.resolve_metric(&metric) else {
        eprintln!(
            "Unknown metric '{metric}'. Known: {}",
            RESOLVABLE_METRICS.join(", ")
        );
        std::process::exit(1);
    };

    if json {
        match serde_json::to_string_pretty(&resolution) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    println!("Probing: {metric}");
    for (i, attempt) in resolution.attempts.iter().enumerate() {
        let (mark, detail) = match &attempt.outcome {
            AttemptOutcome::Accepted => ("✓", "selected".to_string()),
            AttemptOutcome::Rejected(why) => ("✗", format!("rejected: {why}")),
            AttemptOutcome::Failed(why) => ("✗", why.clone()),
        };
        println!("  {}. {mark} {:<24} {detail}", i + 1, attempt.strategy);
    }
    println!();
    match (&resolution.winner, &resolution.value) {
        (Some(winner), Some(value)) => {
            println!("  Source:  {winner}");
            println!("  Value:   {value}");
        }
        _ => {
            println!("  No source produced a value.");
            std::process::exit(1);
        }
    }
}
