//! Alternating least squares for implicit feedback.
//!
//! Observed entries have preference 1 and confidence `1 + alpha * r`,
//! unobserved entries preference 0 and confidence 1. Each sweep solves the
//! regularized normal equations exactly for every user, then every item.

use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::csr::CsrRow;
use nalgebra_sparse::CsrMatrix;
use ndarray::Array2;
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::SeedableRng;
use rand_isaac::Isaac64Rng;
use rayon::prelude::*;
use tracing::info;

use crate::backend::{ensure_shape, top_k, Convergence, Factorizer, Fitted, Hyperparameters, Recommender};
use crate::error::RecError;
use crate::{process, Flt};

#[derive(Debug, Default, Clone, Copy)]
pub struct Als;

pub struct AlsModel {
    user_factors: Array2<Flt>,
    item_factors: Array2<Flt>,
}

impl AlsModel {
    pub fn user_factors(&self) -> &Array2<Flt> {
        &self.user_factors
    }

    pub fn item_factors(&self) -> &Array2<Flt> {
        &self.item_factors
    }

    pub fn scores(&self, user: usize) -> Option<Vec<Flt>> {
        if user >= self.user_factors.nrows() {
            return None;
        }
        Some(self.item_factors.dot(&self.user_factors.row(user)).to_vec())
    }
}

impl Factorizer for Als {
    type Model = AlsModel;

    fn fit(&self, train: &CsrMatrix<Flt>, params: &Hyperparameters) -> Result<Fitted<AlsModel>, RecError> {
        ensure_shape(train)?;
        params.validate()?;
        ensure_ridge(params)?;
        let mut rng = match params.seed {
            Some(seed) => Isaac64Rng::seed_from_u64(seed),
            None => Isaac64Rng::from_entropy(),
        };
        let init = Uniform::new(0.0 as Flt, 0.01 as Flt);
        let mut user_factors = Array2::random_using((train.nrows(), params.factors), init, &mut rng);
        let mut item_factors = Array2::random_using((train.ncols(), params.factors), init, &mut rng);
        let item_users = train.transpose();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(params.num_threads)
            .build()
            .map_err(|e| RecError::Backend(e.to_string()))?;
        info!(
            factors = params.factors,
            iterations = params.iterations,
            threads = params.num_threads,
            "fitting ALS"
        );

        let mut convergence = Convergence::new(params.tolerance);
        for _ in process(params.iterations, params.verbose) {
            user_factors = pool.install(|| solve_side(train, &item_factors, params))?;
            item_factors = pool.install(|| solve_side(&item_users, &user_factors, params))?;
            if convergence.step(objective(train, &user_factors, &item_factors, params)) {
                break;
            }
        }

        Ok(Fitted {
            model: AlsModel { user_factors, item_factors },
            report: convergence.finish(),
        })
    }
}

impl Recommender for AlsModel {
    fn recommend(&self, user: usize, seen: &[usize], k: usize, filter_seen: bool) -> Result<Vec<usize>, RecError> {
        let scores = self.scores(user).ok_or_else(|| RecError::PerUserEvaluation {
            user,
            reason: format!("model was fitted on {} users", self.user_factors.nrows()),
        })?;
        Ok(top_k(&scores, seen, k, filter_seen))
    }
}

/// The normal equations are only guaranteed positive definite with a ridge
/// term, e.g. when there are more factors than items.
pub(crate) fn ensure_ridge(params: &Hyperparameters) -> Result<(), RecError> {
    if params.regularization > 0.0 {
        Ok(())
    } else {
        Err(RecError::InvalidConfig("ALS needs regularization greater than 0".to_string()))
    }
}

fn gram(factors: &Array2<Flt>) -> DMatrix<f64> {
    let g = factors.t().dot(factors);
    DMatrix::from_fn(g.nrows(), g.ncols(), |i, j| g[[i, j]] as f64)
}

/// Recomputes one side's factors with the other side held fixed.
fn solve_side(rows: &CsrMatrix<Flt>, fixed: &Array2<Flt>, params: &Hyperparameters) -> Result<Array2<Flt>, RecError> {
    let factors = fixed.ncols();
    let yty = gram(fixed);
    let solved = (0..rows.nrows())
        .into_par_iter()
        .map(|r| solve_row(r, &rows.row(r), fixed, &yty, params))
        .collect::<Result<Vec<_>, RecError>>()?;
    Array2::from_shape_vec((rows.nrows(), factors), solved.into_iter().flatten().collect())
        .map_err(|e| RecError::Backend(e.to_string()))
}

fn solve_row(
    r: usize,
    row: &CsrRow<Flt>,
    fixed: &Array2<Flt>,
    yty: &DMatrix<f64>,
    params: &Hyperparameters,
) -> Result<Vec<Flt>, RecError> {
    let factors = fixed.ncols();
    if row.nnz() == 0 {
        return Ok(vec![0.0; factors]);
    }
    let mut a = yty.clone();
    let mut b = DVector::<f64>::zeros(factors);
    for (&i, &value) in row.col_indices().iter().zip(row.values()) {
        let y = DVector::from_iterator(factors, fixed.row(i).iter().map(|&v| v as f64));
        let confidence = 1.0 + params.alpha as f64 * value as f64;
        a.ger(confidence - 1.0, &y, &y, 1.0);
        b.axpy(confidence, &y, 1.0);
    }
    for d in 0..factors {
        a[(d, d)] += params.regularization as f64;
    }
    let cholesky = a.cholesky().ok_or_else(|| {
        RecError::Backend(format!("normal equations for row {} are not positive definite", r))
    })?;
    Ok(cholesky.solve(&b).iter().map(|&v| v as Flt).collect())
}

/// Weighted squared error over the full matrix plus the L2 penalty, using
/// `x' (Y'Y) x` for the unobserved part.
fn objective(train: &CsrMatrix<Flt>, user_factors: &Array2<Flt>, item_factors: &Array2<Flt>, params: &Hyperparameters) -> f64 {
    let yty = item_factors.t().dot(item_factors);
    let mut loss = 0.0f64;
    for (u, row) in train.row_iter().enumerate() {
        let x = user_factors.row(u);
        loss += x.dot(&yty.dot(&x)) as f64;
        for (&i, &value) in row.col_indices().iter().zip(row.values()) {
            let score = x.dot(&item_factors.row(i)) as f64;
            let confidence = 1.0 + params.alpha as f64 * value as f64;
            loss += confidence * (1.0 - score).powi(2) - score.powi(2);
        }
    }
    let penalty = user_factors.iter().chain(item_factors.iter()).map(|&v| (v as f64).powi(2)).sum::<f64>();
    loss + params.regularization as f64 * penalty
}
