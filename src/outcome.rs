//! Operation results and the batch runner
//!
//! Lifecycle operations return an [`Outcome`] on success; non-fatal problems
//! become warnings instead of errors. [`run_batch`] applies one operation to
//! several stages with an explicit [`FailMode`].

use crate::error::{Result, StoolError};
use tracing::{debug, warn};

/// Successful result with the warnings collected on the way
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    pub warnings: Vec<String>,
}

impl Outcome {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record and log a warning
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);
        self.warnings.push(message);
    }

    pub fn merge(&mut self, other: Outcome) {
        self.warnings.extend(other.warnings);
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// What to do when one stage of a batch fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailMode {
    /// Stop at the first failure and return it
    #[default]
    AbortFirst,
    /// Process all stages and report every failure
    CollectAll,
    /// Process all stages; failures are logged only
    Ignore,
}

/// Per-stage results of a batch
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<(String, Outcome)>,
    pub failed: Vec<(String, StoolError)>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// All warnings, prefixed with the stage name
    pub fn warnings(&self) -> Vec<String> {
        self.succeeded
            .iter()
            .flat_map(|(stage, outcome)| outcome.warnings.iter().map(move |w| format!("{}: {}", stage, w)))
            .collect()
    }
}

/// Run `op` for every stage in `stages`, in order
pub fn run_batch<F>(stages: &[String], mode: FailMode, mut op: F) -> Result<BatchReport>
where
    F: FnMut(&str) -> Result<Outcome>,
{
    let mut report = BatchReport::default();
    for stage in stages {
        match op(stage) {
            Ok(outcome) => report.succeeded.push((stage.clone(), outcome)),
            Err(e) => match mode {
                FailMode::AbortFirst => return Err(e),
                FailMode::CollectAll => {
                    warn!("{}: {}", stage, e);
                    report.failed.push((stage.clone(), e));
                }
                FailMode::Ignore => debug!("{}: ignored failure: {}", stage, e),
            },
        }
    }
    Ok(report)
}
