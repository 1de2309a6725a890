use std::sync::Arc;

use livestat_core::{EngineConfig, TelemetryEngine};

pub fn run(config: EngineConfig, host: &str, port: u16) {
    let interval = config.sampling_interval_ms;
    let engine = Arc::new(TelemetryEngine::new(config));

    let base = format!("http://{host}:{port}");

    println!("livestat server v{}", livestat_core::VERSION);
    println!("   {base}");
    println!("   sampling every {interval}ms");
    println!();
    println!("   Endpoints:");
    println!("     GET  /                            API index");
    println!("     GET  /health                      Sampling and privilege status");
    println!("     GET  /api/v1/sample               Latest sample");
    println!("     GET  /api/v1/readings             Disk, battery, thermal, fan, power, processes");
    println!("     GET  /api/v1/privileges           Privileged access state");
    println!("     POST /api/v1/privileges/bootstrap Enable privileged access");
    println!("     PUT  /api/v1/interval             {{\"interval_ms\": 1000}}");
    println!();
    println!("   Examples:");
    println!("     curl {base}/api/v1/sample");
    println!("     curl -X PUT -H 'content-type: application/json' -d '{{\"interval_ms\":1000}}' {base}/api/v1/interval");
    println!();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: cannot start runtime: {e}");
            std::process::exit(1);
        }
    };

    engine.start();
    let result = rt.block_on(livestat_server::run_server(engine.clone(), host, port));
    engine.shutdown();

    if let Err(e) = result {
        eprintln!("Error: server on {host}:{port} failed: {e}");
        std::process::exit(1);
    }
}
