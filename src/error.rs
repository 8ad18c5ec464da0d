use std::fmt;

use thiserror::Error;

/// Every failure the library can report.
#[derive(Debug, Error)]
pub enum RecError {
    #[error("malformed row at line {line}: {reason}")]
    DataFormat { line: usize, reason: String },

    #[error("malformed input file: {0}")]
    MalformedFile(String),

    #[error("degenerate interaction matrix with {users} users and {items} items")]
    Shape { users: usize, items: usize },

    #[error("evaluation failed for user {user}: {reason}")]
    PerUserEvaluation { user: usize, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("factorization backend failed: {0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

/// Raised by a backend when it exhausts its iteration budget before the
/// objective settles. The partially converged model is still usable.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceWarning {
    pub iterations: usize,
    pub relative_change: f64,
    pub tolerance: f64,
}

impl fmt::Display for ConvergenceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "objective still moving after {} iterations (relative change {:.6} > tolerance {:.6})",
            self.iterations, self.relative_change, self.tolerance
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Configure,
    Load,
    Encode,
    Partition,
    Fit,
    Evaluate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Configure => "configure",
            Stage::Load => "load",
            Stage::Encode => "encode",
            Stage::Partition => "partition",
            Stage::Fit => "fit",
            Stage::Evaluate => "evaluate",
        };
        f.write_str(name)
    }
}

/// A fatal failure, tagged with the pipeline stage that produced it.
#[derive(Debug, Error)]
#[error("{stage} stage failed")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: RecError,
}

impl RecError {
    pub fn at(self, stage: Stage) -> PipelineError {
        PipelineError { stage, source: self }
    }
}
