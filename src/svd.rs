use nalgebra_sparse::CsrMatrix;
use ndarray::{Array1, Array2};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_isaac::Isaac64Rng;
use shuffle::fy::FisherYates;
use shuffle::shuffler::Shuffler;
use tracing::info;

use crate::backend::{
    ensure_shape, top_k, Convergence, Factorizer, Fitted, Hyperparameters, RatingPredictor, Recommender,
};
use crate::error::RecError;
use crate::{process, Flt};

const INIT_STD_DEV: Flt = 0.1;

/// Biased matrix factorization of explicit ratings, fitted by SGD:
/// `r(u, i) = mu + b_u + b_i + p_u . q_i`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Svd;

pub struct SvdModel {
    global_mean: Flt,
    user_biases: Array1<Flt>,
    item_biases: Array1<Flt>,
    user_factors: Array2<Flt>,
    item_factors: Array2<Flt>,
    rating_range: (Flt, Flt),
}

impl SvdModel {
    fn estimate(&self, user: usize, item: usize) -> Flt {
        self.global_mean
            + self.user_biases[user]
            + self.item_biases[item]
            + self.user_factors.row(user).dot(&self.item_factors.row(item))
    }

    pub fn scores(&self, user: usize) -> Option<Vec<Flt>> {
        if user >= self.user_factors.nrows() {
            return None;
        }
        let scores = self.item_factors.dot(&self.user_factors.row(user))
            + &self.item_biases
            + (self.global_mean + self.user_biases[user]);
        Some(scores.to_vec())
    }
}

impl RatingPredictor for SvdModel {
    /// Predicted rating clipped to the range seen in training.
    fn predict_rating(&self, user: usize, item: usize) -> Option<Flt> {
        if user >= self.user_factors.nrows() || item >= self.item_factors.nrows() {
            return None;
        }
        let (low, high) = self.rating_range;
        Some(self.estimate(user, item).clamp(low, high))
    }
}

impl Recommender for SvdModel {
    fn recommend(&self, user: usize, seen: &[usize], k: usize, filter_seen: bool) -> Result<Vec<usize>, RecError> {
        let scores = self.scores(user).ok_or_else(|| RecError::PerUserEvaluation {
            user,
            reason: format!("model was fitted on {} users", self.user_factors.nrows()),
        })?;
        Ok(top_k(&scores, seen, k, filter_seen))
    }
}

impl Factorizer for Svd {
    type Model = SvdModel;

    fn fit(&self, train: &CsrMatrix<Flt>, params: &Hyperparameters) -> Result<Fitted<SvdModel>, RecError> {
        ensure_shape(train)?;
        params.validate()?;
        let mut rng = match params.seed {
            Some(seed) => Isaac64Rng::seed_from_u64(seed),
            None => Isaac64Rng::from_entropy(),
        };
        let init = Normal::new(0.0, INIT_STD_DEV).map_err(|e| RecError::Backend(e.to_string()))?;

        let ratings: Vec<(usize, usize, Flt)> = train
            .row_iter()
            .enumerate()
            .flat_map(|(u, row)| {
                row.col_indices()
                    .iter()
                    .zip(row.values())
                    .map(move |(&i, &r)| (u, i, r))
                    .collect::<Vec<_>>()
            })
            .collect();
        let global_mean = if ratings.is_empty() {
            0.0
        } else {
            ratings.iter().map(|&(_, _, r)| r).sum::<Flt>() / ratings.len() as Flt
        };
        let rating_range = ratings.iter().fold((Flt::INFINITY, Flt::NEG_INFINITY), |(lo, hi), &(_, _, r)| {
            (lo.min(r), hi.max(r))
        });

        let mut model = SvdModel {
            global_mean,
            user_biases: Array1::zeros(train.nrows()),
            item_biases: Array1::zeros(train.ncols()),
            user_factors: Array2::random_using((train.nrows(), params.factors), init, &mut rng),
            item_factors: Array2::random_using((train.ncols(), params.factors), init, &mut rng),
            rating_range: if ratings.is_empty() { (0.0, 0.0) } else { rating_range },
        };
        info!(factors = params.factors, epochs = params.iterations, "fitting SVD");

        let (lr, reg) = (params.learning_rate, params.regularization);
        let mut fy = FisherYates::default();
        let mut convergence = Convergence::new(params.tolerance);
        for _ in process(params.iterations, params.verbose) {
            let mut order = (0..ratings.len()).collect::<Vec<_>>();
            fy.shuffle(&mut order, &mut rng)
                .map_err(|e| RecError::Backend(format!("shuffle failed: {}", e)))?;
            let mut squared_error = 0.0f64;
            for &idx in &order {
                let (u, i, r) = ratings[idx];
                let err = r - model.estimate(u, i);
                squared_error += (err as f64).powi(2);

                model.user_biases[u] += lr * (err - reg * model.user_biases[u]);
                model.item_biases[i] += lr * (err - reg * model.item_biases[i]);
                for f in 0..params.factors {
                    let (puf, qif) = (model.user_factors[[u, f]], model.item_factors[[i, f]]);
                    model.user_factors[[u, f]] += lr * (err * qif - reg * puf);
                    model.item_factors[[i, f]] += lr * (err * puf - reg * qif);
                }
            }
            let rmse = (squared_error / ratings.len().max(1) as f64).sqrt();
            if !rmse.is_finite() {
                return Err(RecError::Backend("SGD diverged; lower the learning rate".to_string()));
            }
            if convergence.step(rmse) {
                break;
            }
        }

        Ok(Fitted { model, report: convergence.finish() })
    }
}
