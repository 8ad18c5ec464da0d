//! Load, encode, partition, fit and evaluate, in that order. The first
//! failing stage aborts the run.

use tracing::{info, info_span};

use crate::als::Als;
use crate::backend::{row_items, BackendKind, Factorizer, FitReport, Fitted, Hyperparameters, Recommender};
use crate::config::PipelineConfig;
use crate::cross_validation::{random_train_test_split, TrainTestSplit};
use crate::datasets::{build_interactions, load_interactions, EncodedDataset};
use crate::error::{PipelineError, RecError, Stage};
use crate::evaluation::{evaluate, rmse, RankingReport};
use crate::rightfm::RightFM;
use crate::svd::Svd;

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSummary {
    pub users: usize,
    pub items: usize,
    pub interactions: usize,
    pub train_interactions: usize,
    pub test_interactions: usize,
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub dataset: DatasetSummary,
    pub fit: FitReport,
    pub ranking: RankingReport,
    /// Held-out rating error, for backends that predict ratings.
    pub rmse: Option<f64>,
    /// External item ids recommended to the requested user.
    pub recommendations: Option<Vec<String>>,
}

/// Runs every stage on `config`. With `recommend_for`, the top-k items for
/// that external user id are looked up after evaluation.
pub fn run(config: &PipelineConfig, recommend_for: Option<&str>) -> Result<PipelineReport, PipelineError> {
    config.validate().map_err(|e| e.at(Stage::Configure))?;
    let separator = config.dataset.separator_byte().map_err(|e| e.at(Stage::Configure))?;

    let path = config.dataset.path();
    let records = {
        let _span = info_span!("load", path = %path.display()).entered();
        load_interactions(&path, separator).map_err(|e| e.at(Stage::Load))?
    };

    let dataset = build_interactions(&records, &config.dataset.encoding());
    dataset.ensure_not_degenerate().map_err(|e| e.at(Stage::Encode))?;
    let target = recommend_for
        .map(|id| {
            dataset
                .users
                .index(id)
                .ok_or_else(|| RecError::InvalidConfig(format!("user {:?} does not appear in the dataset", id)))
        })
        .transpose()
        .map_err(|e| e.at(Stage::Encode))?;

    let split = random_train_test_split(
        &dataset.interactions,
        config.split.hold_out(),
        config.split.min_interactions,
        config.split.seed,
    )
    .map_err(|e| e.at(Stage::Partition))?;

    let params = &config.model.hyperparameters;
    let (fit, ranking, recommended, rating_error) = match config.model.backend {
        BackendKind::Als => {
            let fitted = fit_model(&Als, &split, params)?;
            let (ranking, recommended) = score(&fitted.model, &split, config, target)?;
            (fitted.report, ranking, recommended, None)
        }
        BackendKind::Warp => {
            let fitted = fit_model(&RightFM, &split, params)?;
            let (ranking, recommended) = score(&fitted.model, &split, config, target)?;
            (fitted.report, ranking, recommended, None)
        }
        BackendKind::Svd => {
            let fitted = fit_model(&Svd, &split, params)?;
            let (ranking, recommended) = score(&fitted.model, &split, config, target)?;
            let error = rmse(&fitted.model, &split.test);
            (fitted.report, ranking, recommended, error)
        }
    };

    Ok(PipelineReport {
        dataset: summarize(&dataset, &split),
        fit,
        ranking,
        rmse: rating_error,
        recommendations: recommended.map(|items| external_ids(&dataset, &items)),
    })
}

fn fit_model<F: Factorizer>(
    factorizer: &F,
    split: &TrainTestSplit,
    params: &Hyperparameters,
) -> Result<Fitted<F::Model>, PipelineError> {
    let _span = info_span!("fit").entered();
    factorizer.fit(&split.train, params).map_err(|e| e.at(Stage::Fit))
}

fn score<M: Recommender>(
    model: &M,
    split: &TrainTestSplit,
    config: &PipelineConfig,
    target: Option<usize>,
) -> Result<(RankingReport, Option<Vec<usize>>), PipelineError> {
    let _span = info_span!("evaluate").entered();
    let ranking = evaluate(model, &split.train, &split.test, &config.evaluation).map_err(|e| e.at(Stage::Evaluate))?;
    let recommended = target
        .map(|user| model.recommend(user, row_items(&split.train, user), config.evaluation.k, true))
        .transpose()
        .map_err(|e| e.at(Stage::Evaluate))?;
    Ok((ranking, recommended))
}

fn summarize(dataset: &EncodedDataset, split: &TrainTestSplit) -> DatasetSummary {
    let (users, items) = dataset.shape();
    let summary = DatasetSummary {
        users,
        items,
        interactions: dataset.interactions.nnz(),
        train_interactions: split.train.nnz(),
        test_interactions: split.test.nnz(),
    };
    info!(?summary, "run finished");
    summary
}

fn external_ids(dataset: &EncodedDataset, items: &[usize]) -> Vec<String> {
    items
        .iter()
        .filter_map(|&i| dataset.items.id(i))
        .map(str::to_string)
        .collect()
}
