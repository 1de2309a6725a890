//! Error taxonomy and the probe boundary type.
//!
//! Probes never propagate errors into the tick loop. A failing probe produces a
//! [`ProbeError`], which is converted into a [`ProbeResult`] with no value at the
//! probe boundary. Only the privilege bootstrap surfaces a terminal error to the
//! operator.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Why a probe produced no value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// The probe ran but had nothing usable to report. Shown as "N/A".
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// An external call exceeded its deadline.
    #[error("{source_name} timed out after {after:?}")]
    Timeout {
        source_name: String,
        after: Duration,
    },

    /// The process failed to start, exited abnormally, produced unparsable output
    /// or panicked.
    #[error("{source_name} crashed: {reason}")]
    Crashed { source_name: String, reason: String },
}

impl ProbeError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn crashed(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Crashed {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-friendly tag, used in diagnostics and the HTTP surface.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Timeout { .. } => "timeout",
            Self::Crashed { .. } => "crashed",
        }
    }
}

/// Terminal failure of the privilege bootstrap workflow.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum BootstrapError {
    #[error("{step} failed: {reason}")]
    StepFailed { step: String, reason: String },
}

impl BootstrapError {
    pub fn step_failed(step: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::StepFailed {
            step: step.to_string(),
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::StepFailed { reason, .. } => reason,
        }
    }
}

/// Failure to read or write an engine configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Outcome of one probe: a value, or nothing plus a human-readable reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult<T> {
    pub value: Option<T>,
    pub diagnostic: Option<String>,
}

impl<T> ProbeResult<T> {
    pub fn ok(value: T) -> Self {
        Self {
            value: Some(value),
            diagnostic: None,
        }
    }

    pub fn unavailable(diagnostic: impl Into<String>) -> Self {
        Self {
            value: None,
            diagnostic: Some(diagnostic.into()),
        }
    }

    /// Convert a fallible probe outcome, applying the logging policy:
    /// unavailability stays quiet, timeouts and crashes are reported with the
    /// probe name.
    pub fn from_result(probe: &str, result: Result<T, ProbeError>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(err) => {
                match &err {
                    ProbeError::Unavailable(msg) => log::debug!("{probe}: {msg}"),
                    ProbeError::Timeout { .. } | ProbeError::Crashed { .. } => {
                        log::warn!("{probe}: {err}")
                    }
                }
                Self::unavailable(err.to_string())
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.value.is_some()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ProbeResult<U> {
        ProbeResult {
            value: self.value.map(f),
            diagnostic: self.diagnostic,
        }
    }
}

impl<T: Clone> ProbeResult<T> {
    pub fn value_cloned(&self) -> Option<T> {
        self.value.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_result_keeps_value() {
        let r = ProbeResult::from_result("t", Ok::<_, ProbeError>(7));
        assert_eq!(r.value, Some(7));
        assert!(r.diagnostic.is_none());
    }

    #[test]
    fn from_result_turns_errors_into_unavailable() {
        let r: ProbeResult<u32> = ProbeResult::from_result(
            "t",
            Err(ProbeError::Timeout {
                source_name: "ioreg".into(),
                after: Duration::from_secs(2),
            }),
        );
        assert!(!r.is_available());
        assert!(r.diagnostic.unwrap().contains("ioreg timed out"));
    }

    #[test]
    fn error_kinds() {
        assert_eq!(ProbeError::unavailable("x").kind(), "unavailable");
        assert_eq!(ProbeError::crashed("df", "exit 1").kind(), "crashed");
        let e = BootstrapError::step_failed("install tool", "brew missing");
        assert_eq!(e.to_string(), "install tool failed: brew missing");
        assert_eq!(e.reason(), "brew missing");
    }
}
