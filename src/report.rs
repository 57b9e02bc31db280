use std::fmt;

use tracing::warn;

use crate::error::Error;

/// Per-job diagnostic stream. Translators never abort on a single bad
/// element; they record what went wrong here and keep going. The caller gets
/// the whole list at once instead of the first failure encountered.
#[derive(Debug, Default)]
pub struct Report {
    warnings: Vec<String>,
    errors: Vec<String>,
}

/// How a job ended, given its report and whether it produced output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Complete,
    CompleteWithWarnings,
    Failed,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn<T: Into<String>>(&mut self, what: T) {
        let what = what.into();
        warn!("{}", what);
        self.warnings.push(what);
    }

    pub fn error<T: Into<String>>(&mut self, what: T) {
        let what = what.into();
        warn!("{}", what);
        self.errors.push(what);
    }

    /// Record a sub-tree failure and continue with the rest of the job.
    pub fn capture(&mut self, ctx: &str, err: Error) {
        self.error(format!("{}: {}", ctx, err));
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty() && self.errors.is_empty()
    }

    /// A job that produced any output has completed, warnings or not; only a
    /// fatal document failure (handled before a Report exists) fails a job.
    pub fn outcome(&self, produced_output: bool) -> Outcome {
        if !produced_output && !self.errors.is_empty() {
            Outcome::Failed
        } else if self.is_clean() {
            Outcome::Complete
        } else {
            Outcome::CompleteWithWarnings
        }
    }

}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for w in &self.warnings {
            writeln!(f, "warning: {}", w)?;
        }
        for e in &self.errors {
            writeln!(f, "error: {}", e)?;
        }
        Ok(())
    }
}
