//! Ordered fallback chains.
//!
//! A [`SourceResolver`] holds the acquisition strategies for one logical metric,
//! most preferred first. Strategies are tried in order and the first one that
//! returns a structurally valid value wins; later strategies are not run. When
//! none succeeds the metric is unavailable, which is not an error.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use serde::Serialize;

use crate::error::{ProbeError, ProbeResult};

/// Structural validity check applied to every strategy result.
pub trait Validate {
    /// `Err` carries a short explanation of why the value was rejected.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

macro_rules! always_valid {
    ($($t:ty),*) => { $(impl Validate for $t {})* };
}

always_valid!(u64, String);

impl Validate for f64 {
    fn validate(&self) -> Result<(), String> {
        if self.is_finite() {
            Ok(())
        } else {
            Err(format!("non-finite value {self}"))
        }
    }
}

type StrategyFn<T> = dyn Fn() -> Result<T, ProbeError> + Send + Sync;

/// One named way of acquiring a metric.
pub struct Strategy<T> {
    name: &'static str,
    run: Box<StrategyFn<T>>,
}

impl<T> Strategy<T> {
    pub fn new<F>(name: &'static str, run: F) -> Self
    where
        F: Fn() -> Result<T, ProbeError> + Send + Sync + 'static,
    {
        Self {
            name,
            run: Box::new(run),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> fmt::Debug for Strategy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strategy").field("name", &self.name).finish()
    }
}

/// What happened when one strategy was tried.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attempt {
    pub strategy: &'static str,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Accepted,
    Rejected(String),
    Failed(String),
}

/// Result of resolving a chain, with the trail of attempts for introspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution<T> {
    pub value: Option<T>,
    pub winner: Option<&'static str>,
    pub attempts: Vec<Attempt>,
}

impl<T> Resolution<T> {
    pub fn into_probe_result(self) -> ProbeResult<T> {
        match self.value {
            Some(v) => ProbeResult::ok(v),
            None => ProbeResult::unavailable(self.summary()),
        }
    }

    /// Same trail with the value rendered for display.
    pub fn describe(self) -> Resolution<String>
    where
        T: fmt::Debug,
    {
        Resolution {
            value: self.value.map(|v| format!("{v:?}")),
            winner: self.winner,
            attempts: self.attempts,
        }
    }

    /// Continue with another chain when this one produced nothing. The attempt
    /// trails are joined in order.
    pub fn or_else<F>(mut self, next: F) -> Resolution<T>
    where
        F: FnOnce() -> Resolution<T>,
    {
        if self.value.is_some() {
            return self;
        }
        let mut rest = next();
        self.attempts.append(&mut rest.attempts);
        rest.attempts = self.attempts;
        rest
    }

    /// One-line summary of why each strategy did not win.
    pub fn summary(&self) -> String {
        if self.attempts.is_empty() {
            return "no strategies".to_string();
        }
        self.attempts
            .iter()
            .map(|a| match &a.outcome {
                AttemptOutcome::Accepted => format!("{}: ok", a.strategy),
                AttemptOutcome::Rejected(why) => format!("{}: rejected ({why})", a.strategy),
                AttemptOutcome::Failed(why) => format!("{}: {why}", a.strategy),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Ordered strategies for one metric.
pub struct SourceResolver<T> {
    metric: &'static str,
    strategies: Vec<Strategy<T>>,
}

impl<T: Validate> SourceResolver<T> {
    pub fn new(metric: &'static str) -> Self {
        Self {
            metric,
            strategies: Vec::new(),
        }
    }

    /// Append a strategy at the lowest preference.
    pub fn with(mut self, strategy: Strategy<T>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn push(&mut self, strategy: Strategy<T>) {
        self.strategies.push(strategy);
    }

    pub fn metric(&self) -> &'static str {
        self.metric
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name).collect()
    }

    /// Try strategies in order until one yields a valid value.
    pub fn resolve(&self) -> Resolution<T> {
        let mut attempts = Vec::new();
        for strategy in &self.strategies {
            let outcome = catch_unwind(AssertUnwindSafe(|| (strategy.run)())).unwrap_or_else(|_| {
                Err(ProbeError::crashed(strategy.name, "strategy panicked"))
            });
            match outcome {
                Ok(value) => match value.validate() {
                    Ok(()) => {
                        attempts.push(Attempt {
                            strategy: strategy.name,
                            outcome: AttemptOutcome::Accepted,
                        });
                        log::debug!("{}: resolved via {}", self.metric, strategy.name);
                        return Resolution {
                            value: Some(value),
                            winner: Some(strategy.name),
                            attempts,
                        };
                    }
                    Err(why) => {
                        log::debug!("{}: {} rejected: {why}", self.metric, strategy.name);
                        attempts.push(Attempt {
                            strategy: strategy.name,
                            outcome: AttemptOutcome::Rejected(why),
                        });
                    }
                },
                Err(err) => {
                    match &err {
                        ProbeError::Unavailable(_) => {
                            log::debug!("{}: {}: {err}", self.metric, strategy.name)
                        }
                        _ => log::warn!("{}: {}: {err}", self.metric, strategy.name),
                    }
                    attempts.push(Attempt {
                        strategy: strategy.name,
                        outcome: AttemptOutcome::Failed(err.to_string()),
                    });
                }
            }
        }
        Resolution {
            value: None,
            winner: None,
            attempts,
        }
    }

    /// [`resolve`](Self::resolve) reduced to the probe boundary type.
    pub fn probe(&self) -> ProbeResult<T> {
        self.resolve().into_probe_result()
    }
}
