use std::str::FromStr;

use nalgebra_sparse::CsrMatrix;
use rand::SeedableRng;
use rand_isaac::Isaac64Rng;
use serde::Deserialize;
use shuffle::fy::FisherYates;
use shuffle::shuffler::Shuffler;
use tracing::info;

use crate::backend::{ensure_shape, top_k, Convergence, Factorizer, Fitted, Hyperparameters, Recommender};
use crate::error::RecError;
use crate::rightfm_fast::{fit_bpr, fit_warp, FastRightFM};
use crate::{process, Flt};

#[derive(Debug, Eq, PartialEq, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LearningSchedule {
    AdaGrad,
    AdaDelta,
}

impl FromStr for LearningSchedule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "adagrad" => Ok(LearningSchedule::AdaGrad),
            "adadelta" => Ok(LearningSchedule::AdaDelta),
            _ => Err(format!("Invalid learning schedule: {}", s)),
        }
    }
}

#[derive(Debug, Eq, PartialEq, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Loss {
    Warp,
    Bpr,
}

impl FromStr for Loss {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "warp" => Ok(Loss::Warp),
            "bpr" => Ok(Loss::Bpr),
            _ => Err(format!("Invalid loss type: {}", s)),
        }
    }
}

/// Pairwise-ranking factorization in the style of LightFM, without side
/// features: every user and item owns one embedding and one bias.
#[derive(Debug, Default, Clone, Copy)]
pub struct RightFM;

pub struct RightFMModel {
    data: FastRightFM,
}

impl RightFMModel {
    pub fn no_users(&self) -> usize {
        self.data.users.rows()
    }

    pub fn no_items(&self) -> usize {
        self.data.items.rows()
    }

    pub fn scores(&self, user: usize) -> Option<Vec<Flt>> {
        (user < self.no_users()).then(|| self.data.scores(user))
    }
}

impl Factorizer for RightFM {
    type Model = RightFMModel;

    fn fit(&self, train: &CsrMatrix<Flt>, params: &Hyperparameters) -> Result<Fitted<RightFMModel>, RecError> {
        ensure_shape(train)?;
        params.validate()?;
        let mut rng = match params.seed {
            Some(seed) => Isaac64Rng::seed_from_u64(seed),
            None => Isaac64Rng::from_entropy(),
        };
        let (no_users, no_items) = (train.nrows(), train.ncols());
        let mut data = FastRightFM::new(no_users, no_items, params, &mut rng);

        let (user_ids, item_ids, values) = triplets(train);
        let no_examples = values.len();
        let mut fy = FisherYates::default();
        let mut convergence = Convergence::new(params.tolerance);
        info!(
            loss = ?params.loss,
            factors = params.factors,
            epochs = params.iterations,
            "fitting pairwise factorization"
        );

        for _ in process(params.iterations, params.verbose) {
            let mut shuffled_indices = (0..no_examples).collect::<Vec<_>>();
            fy.shuffle(&mut shuffled_indices, &mut rng)
                .map_err(|e| RecError::Backend(format!("shuffle failed: {}", e)))?;
            let epoch_loss = match params.loss {
                Loss::Warp => fit_warp(train, &user_ids, &item_ids, &values, &shuffled_indices, &mut data, &mut rng),
                Loss::Bpr => fit_bpr(train, &user_ids, &item_ids, &values, &shuffled_indices, &mut data, &mut rng),
            };
            if convergence.step(epoch_loss as f64 / no_examples.max(1) as f64) {
                break;
            }
        }

        Ok(Fitted { model: RightFMModel { data }, report: convergence.finish() })
    }
}

impl Recommender for RightFMModel {
    fn recommend(&self, user: usize, seen: &[usize], k: usize, filter_seen: bool) -> Result<Vec<usize>, RecError> {
        let scores = self.scores(user).ok_or_else(|| RecError::PerUserEvaluation {
            user,
            reason: format!("model was fitted on {} users", self.no_users()),
        })?;
        Ok(top_k(&scores, seen, k, filter_seen))
    }
}

fn triplets(interactions: &CsrMatrix<Flt>) -> (Vec<usize>, Vec<usize>, Vec<Flt>) {
    let mut user_ids = Vec::with_capacity(interactions.nnz());
    let mut item_ids = Vec::with_capacity(interactions.nnz());
    let mut values = Vec::with_capacity(interactions.nnz());
    for (user, row) in interactions.row_iter().enumerate() {
        for (&item, &value) in row.col_indices().iter().zip(row.values()) {
            user_ids.push(user);
            item_ids.push(item);
            values.push(value);
        }
    }
    (user_ids, item_ids, values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::row_items;
    use nalgebra_sparse::CooMatrix;

    // Two taste clusters: users 0..10 like items 0..5, users 10..20 like items 5..10.
    fn clustered() -> CsrMatrix<Flt> {
        let mut coo = CooMatrix::new(20, 10);
        for u in 0..20 {
            let base = if u < 10 { 0 } else { 5 };
            for i in 0..5 {
                if (u + i) % 5 != 0 {
                    coo.push(u, base + i, 1.0);
                }
            }
        }
        CsrMatrix::from(&coo)
    }

    fn params(loss: Loss) -> Hyperparameters {
        Hyperparameters {
            factors: 8,
            iterations: 50,
            learning_rate: 0.1,
            loss,
            seed: Some(17),
            ..Hyperparameters::default()
        }
    }

    #[test]
    fn test_loss_from_str() {
        assert_eq!("WARP".parse::<Loss>(), Ok(Loss::Warp));
        assert_eq!("bpr".parse::<Loss>(), Ok(Loss::Bpr));
        assert!("logistic".parse::<Loss>().is_err());
        assert_eq!("adadelta".parse::<LearningSchedule>(), Ok(LearningSchedule::AdaDelta));
    }

    #[test]
    fn test_fit_rejects_degenerate_matrix() {
        let empty = CsrMatrix::<Flt>::zeros(0, 4);
        assert!(matches!(
            RightFM.fit(&empty, &params(Loss::Warp)),
            Err(RecError::Shape { users: 0, items: 4 })
        ));
    }

    #[test]
    fn test_warp_learns_clusters() {
        let train = clustered();
        let fitted = RightFM.fit(&train, &params(Loss::Warp)).unwrap();
        let model = fitted.model;
        let in_cluster = |scores: &[Flt], range: std::ops::Range<usize>| {
            scores[range.clone()].iter().sum::<Flt>() / range.len() as Flt
        };
        let scores = model.scores(1).unwrap();
        assert!(in_cluster(&scores, 0..5) > in_cluster(&scores, 5..10));
        let scores = model.scores(12).unwrap();
        assert!(in_cluster(&scores, 5..10) > in_cluster(&scores, 0..5));
    }

    #[test]
    fn test_bpr_fits_and_filters_seen() {
        let train = clustered();
        let fitted = RightFM.fit(&train, &params(Loss::Bpr)).unwrap();
        assert!(fitted.report.iterations >= 1);
        let seen = row_items(&train, 3);
        let recs = fitted.model.recommend(3, seen, 10, true).unwrap();
        assert_eq!(recs.len(), 10 - seen.len());
        assert!(recs.iter().all(|i| !seen.contains(i)));
    }

    #[test]
    fn test_same_seed_same_model() {
        let train = clustered();
        let a = RightFM.fit(&train, &params(Loss::Warp)).unwrap().model;
        let b = RightFM.fit(&train, &params(Loss::Warp)).unwrap().model;
        assert_eq!(a.scores(4), b.scores(4));
    }

    #[test]
    fn test_unknown_user_is_an_error() {
        let train = clustered();
        let model = RightFM.fit(&train, &params(Loss::Warp)).unwrap().model;
        assert!(model.recommend(99, &[], 3, true).is_err());
    }
}
