//! CLI for livestat: live device telemetry from unreliable OS sources.

mod commands;
mod format;
mod tui;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "livestat")]
#[command(about = "livestat: one steady telemetry stream from CPU, GPU, memory, disk and network")]
#[command(version = livestat_core::VERSION)]
struct Cli {
    /// Log debug output to stderr (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Engine config file (JSON). Missing files fall back to defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Sampling interval in milliseconds (clamped to 200-5000)
    #[arg(long, global = true)]
    interval: Option<u64>,

    /// Comma-separated metrics to sample: cpu,gpu,ram,disk,net
    #[arg(long, global = true)]
    metrics: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream samples to stdout until Ctrl-C
    Watch {
        /// One JSON object per line instead of text
        #[arg(long)]
        json: bool,

        /// Stop after N samples (0 = until Ctrl-C)
        #[arg(long, default_value = "0")]
        count: u64,
    },

    /// Interactive dashboard: +/- change the interval, p enables privileged access, q quits
    Monitor,

    /// Take one sample plus the slow readings and print them
    Snapshot {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,

        /// Delay between the samples rates are computed from, in milliseconds
        #[arg(long, default_value = "500")]
        settle_ms: u64,
    },

    /// Show which source serves a metric and why the others were skipped.
    /// Without a metric, list the metrics that can be probed.
    Probe {
        /// Metric name, e.g. cpu, gpu, disk, battery, thermal
        metric: Option<String>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Install tools and a passwordless sudo policy for the privileged probes
    EnablePrivileges,

    /// Serve samples and readings over HTTP
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8043")]
        port: u16,

        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Print the effective configuration
    Config {
        /// Write the effective configuration back to --config
        #[arg(long)]
        save: bool,
    },
}

fn init_logging(verbose: bool, draws_on_terminal: bool) {
    let default_filter = if verbose {
        "debug"
    } else if draws_on_terminal {
        "error"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, matches!(cli.command, Commands::Monitor));

    let config = commands::load_config(cli.config.as_deref(), cli.interval, cli.metrics.as_deref())
        .unwrap_or_else(|e| {
            eprintln!("Error: {e}");
            std::process::exit(2);
        });

    match cli.command {
        Commands::Watch { json, count } => commands::watch::run(config, json, count),
        Commands::Monitor => commands::monitor::run(config),
        Commands::Snapshot { json, settle_ms } => commands::snapshot::run(config, json, settle_ms),
        Commands::Probe { metric, json } => commands::probe::run(config, metric.as_deref(), json),
        Commands::EnablePrivileges => commands::privileges::run(config),
        Commands::Serve { port, host } => commands::serve::run(config, &host, port),
        Commands::Config { save } => commands::show_config(&config, cli.config.as_deref(), save),
    }
}
