use std::cmp::Ordering;
use std::str::FromStr;

use nalgebra_sparse::CsrMatrix;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{ConvergenceWarning, RecError};
use crate::rightfm::{LearningSchedule, Loss};
use crate::Flt;

/// A factorization routine. Fitting consumes a train matrix and produces a
/// model able to rank items for the users it was fitted on.
pub trait Factorizer {
    type Model: Recommender;

    fn fit(&self, train: &CsrMatrix<Flt>, params: &Hyperparameters) -> Result<Fitted<Self::Model>, RecError>;
}

pub trait Recommender {
    /// Ranks items for `user` best first.
    ///
    /// `seen` holds the user's training items in ascending order. With
    /// `filter_seen` they never appear in the output. The result has
    /// `min(k, eligible items)` entries.
    fn recommend(&self, user: usize, seen: &[usize], k: usize, filter_seen: bool) -> Result<Vec<usize>, RecError>;
}

/// Backends that also predict explicit ratings.
pub trait RatingPredictor {
    fn predict_rating(&self, user: usize, item: usize) -> Option<Flt>;
}

pub struct Fitted<M> {
    pub model: M,
    pub report: FitReport,
}

#[derive(Debug, Clone)]
pub struct FitReport {
    pub iterations: usize,
    pub objective: f64,
    pub warning: Option<ConvergenceWarning>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Als,
    Warp,
    Svd,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "als" => Ok(BackendKind::Als),
            "warp" | "lightfm" => Ok(BackendKind::Warp),
            "svd" => Ok(BackendKind::Svd),
            _ => Err(format!("Invalid backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    pub factors: usize,
    /// ALS sweeps, or SGD epochs for the other backends.
    pub iterations: usize,
    pub regularization: Flt,
    pub learning_rate: Flt,
    /// ALS confidence scaling.
    pub alpha: Flt,
    pub loss: Loss,
    pub learning_schedule: LearningSchedule,
    pub max_sampled: usize,
    pub rho: Flt,
    pub epsilon: f64,
    /// Relative objective change under which fitting stops early.
    pub tolerance: f64,
    pub num_threads: usize,
    pub seed: Option<u64>,
    pub verbose: bool,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters {
            factors: 50,
            iterations: 20,
            regularization: 0.01,
            learning_rate: 0.05,
            alpha: 1.0,
            loss: Loss::Warp,
            learning_schedule: LearningSchedule::AdaGrad,
            max_sampled: 10,
            rho: 0.95,
            epsilon: 1e-6,
            tolerance: 1e-4,
            num_threads: 1,
            seed: Some(42),
            verbose: false,
        }
    }
}

impl Hyperparameters {
    pub fn validate(&self) -> Result<(), RecError> {
        let invalid = |msg: &str| Err(RecError::InvalidConfig(msg.to_string()));
        if self.factors == 0 {
            return invalid("factors must be greater than 0");
        }
        if self.iterations == 0 {
            return invalid("iterations must be greater than 0");
        }
        if self.num_threads == 0 {
            return invalid("num_threads must be greater than 0");
        }
        if self.regularization < 0.0 || self.alpha < 0.0 {
            return invalid("regularization and alpha must be non-negative");
        }
        if !(self.learning_rate > 0.0) {
            return invalid("learning_rate must be positive");
        }
        if !(0.0 < self.rho && self.rho < 1.0) || self.epsilon < 0.0 {
            return invalid("rho must be in (0, 1) and epsilon non-negative");
        }
        Ok(())
    }
}

/// Column indices stored in one row, in ascending order.
pub fn row_items(matrix: &CsrMatrix<Flt>, row: usize) -> &[usize] {
    let offsets = matrix.row_offsets();
    &matrix.col_indices()[offsets[row]..offsets[row + 1]]
}

pub(crate) fn ensure_shape(train: &CsrMatrix<Flt>) -> Result<(), RecError> {
    if train.nrows() == 0 || train.ncols() == 0 {
        return Err(RecError::Shape { users: train.nrows(), items: train.ncols() });
    }
    Ok(())
}

/// Tracks an iterative objective and decides when it has settled.
pub(crate) struct Convergence {
    tolerance: f64,
    previous: Option<f64>,
    last_change: f64,
    iterations: usize,
}

impl Convergence {
    pub(crate) fn new(tolerance: f64) -> Convergence {
        Convergence { tolerance, previous: None, last_change: f64::INFINITY, iterations: 0 }
    }

    /// Records one iteration and returns true once the objective is stable.
    pub(crate) fn step(&mut self, objective: f64) -> bool {
        self.iterations += 1;
        debug!(iteration = self.iterations, objective, "objective");
        if let Some(previous) = self.previous {
            self.last_change = (previous - objective).abs() / previous.abs().max(f64::EPSILON);
        }
        self.previous = Some(objective);
        self.last_change < self.tolerance
    }

    pub(crate) fn finish(self) -> FitReport {
        let warning = if self.last_change < self.tolerance {
            None
        } else {
            let warning = ConvergenceWarning {
                iterations: self.iterations,
                relative_change: self.last_change,
                tolerance: self.tolerance,
            };
            warn!("{}", warning);
            Some(warning)
        };
        FitReport {
            iterations: self.iterations,
            objective: self.previous.unwrap_or(f64::NAN),
            warning,
        }
    }
}

/// Selects the `k` best scored items, skipping those in `seen` when asked.
/// Ties go to the lower item index.
pub(crate) fn top_k(scores: &[Flt], seen: &[usize], k: usize, filter_seen: bool) -> Vec<usize> {
    let mut candidates: Vec<(usize, Flt)> = scores
        .iter()
        .copied()
        .enumerate()
        .filter(|(item, _)| !(filter_seen && seen.binary_search(item).is_ok()))
        .collect();
    let by_score = |a: &(usize, Flt), b: &(usize, Flt)| match b.1.total_cmp(&a.1) {
        Ordering::Equal => a.0.cmp(&b.0),
        other => other,
    };
    let k = k.min(candidates.len());
    if k == 0 {
        return Vec::new();
    }
    if k < candidates.len() {
        candidates.select_nth_unstable_by(k - 1, by_score);
        candidates.truncate(k);
    }
    candidates.sort_unstable_by(by_score);
    candidates.into_iter().map(|(item, _)| item).collect()
}
