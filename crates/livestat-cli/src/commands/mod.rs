pub mod monitor;
pub mod privileges;
pub mod probe;
pub mod serve;
pub mod snapshot;
pub mod watch;

use std::collections::BTreeSet;
use std::path::Path;

use livestat_core::{EngineConfig, MetricKind};

/// Build the effective configuration: file (or defaults), then command-line
/// overrides, then normalization.
pub fn load_config(
    path: Option<&Path>,
    interval_ms: Option<u64>,
    metrics: Option<&str>,
) -> Result<EngineConfig, String> {
    let mut config = match path {
        Some(p) => EngineConfig::load(p).map_err(|e| format!("{}: {e}", p.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(ms) = interval_ms {
        config.sampling_interval_ms = ms;
    }
    if let Some(list) = metrics {
        config.enabled_metrics = parse_metrics(list)?;
    }
    let config = config.normalized();
    log::debug!(
        "config: {}ms, metrics {:?}",
        config.sampling_interval_ms,
        config.enabled_metrics
    );
    Ok(config)
}

/// Parse a comma-separated metric list. `all` selects every metric.
pub fn parse_metrics(list: &str) -> Result<BTreeSet<MetricKind>, String> {
    if list.trim().eq_ignore_ascii_case("all") {
        return Ok(MetricKind::ALL.into_iter().collect());
    }
    let metrics = list
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(str::parse)
        .collect::<Result<BTreeSet<MetricKind>, String>>()?;
    if metrics.is_empty() {
        return Err("no metrics selected".into());
    }
    Ok(metrics)
}

pub fn show_config(config: &EngineConfig, path: Option<&Path>, save: bool) {
    match serde_json::to_string_pretty(config) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
    if !save {
        return;
    }
    let Some(path) = path else {
        eprintln!("Error: --save needs --config <path>");
        std::process::exit(2);
    };
    if let Err(e) = config.save(path) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    eprintln!("Saved to {}", path.display());
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // parse_metrics
    // -----------------------------------------------------------------------

    #[test]
    fn parse_metrics_accepts_aliases() {
        let m = parse_metrics("cpu, memory,network").unwrap();
        assert_eq!(
            m.into_iter().collect::<Vec<_>>(),
            vec![MetricKind::Cpu, MetricKind::Ram, MetricKind::Net]
        );
    }

    #[test]
    fn parse_metrics_all() {
        assert_eq!(parse_metrics("all").unwrap().len(), MetricKind::ALL.len());
    }

    #[test]
    fn parse_metrics_rejects_unknown_and_empty() {
        assert!(parse_metrics("cpu,fans").unwrap_err().contains("fans"));
        assert!(parse_metrics(" , ").is_err());
    }

    // -----------------------------------------------------------------------
    // load_config
    // -----------------------------------------------------------------------

    #[test]
    fn overrides_apply_after_file_and_clamp() {
        let config = load_config(None, Some(50_000), Some("gpu")).unwrap();
        assert_eq!(config.sampling_interval_ms, 5000);
        assert!(config.is_enabled(MetricKind::Gpu));
        assert!(!config.is_enabled(MetricKind::Cpu));
    }

    #[test]
    fn bad_metric_override_is_an_error() {
        assert!(load_config(None, None, Some("cpu,bogus")).is_err());
    }
}
