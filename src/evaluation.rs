use nalgebra_sparse::CsrMatrix;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::backend::{row_items, RatingPredictor, Recommender};
use crate::error::RecError;
use crate::{process, Flt};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub k: usize,
    pub filter_seen: bool,
    pub verbose: bool,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        EvaluationConfig { k: 10, filter_seen: true, verbose: false }
    }
}

fn hits(recommended: &[usize], actual: &[usize], k: usize) -> usize {
    recommended.iter().take(k).filter(|item| actual.contains(item)).count()
}

fn discount(rank: usize) -> f64 {
    1.0 / ((rank + 2) as f64).log2()
}

/// Share of the `k` slots filled with relevant items. The denominator is
/// always `k`, even for shorter lists.
pub fn precision_at_k(recommended: &[usize], actual: &[usize], k: usize) -> f64 {
    if actual.is_empty() || k == 0 {
        return 0.0;
    }
    hits(recommended, actual, k) as f64 / k as f64
}

pub fn recall_at_k(recommended: &[usize], actual: &[usize], k: usize) -> f64 {
    if actual.is_empty() || k == 0 {
        return 0.0;
    }
    hits(recommended, actual, k) as f64 / actual.len() as f64
}

/// Binary-relevance NDCG, normalized by `min(|actual|, k)` relevant items at
/// the top ranks.
pub fn ndcg_at_k(recommended: &[usize], actual: &[usize], k: usize) -> f64 {
    let idcg: f64 = (0..actual.len().min(k)).map(discount).sum();
    if idcg == 0.0 {
        return 0.0;
    }
    let dcg: f64 = recommended
        .iter()
        .take(k)
        .enumerate()
        .filter(|(_, item)| actual.contains(item))
        .map(|(rank, _)| discount(rank))
        .sum();
    dcg / idcg
}

/// Aggregated ranking metrics. Only users with held-out items are scored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankingReport {
    pub k: usize,
    pub scored_users: usize,
    pub skipped_users: usize,
    precision_sum: f64,
    recall_sum: f64,
    ndcg_sum: f64,
}

impl RankingReport {
    fn mean(&self, sum: f64) -> Option<f64> {
        (self.scored_users > 0).then(|| sum / self.scored_users as f64)
    }

    pub fn precision(&self) -> Option<f64> {
        self.mean(self.precision_sum)
    }

    pub fn recall(&self) -> Option<f64> {
        self.mean(self.recall_sum)
    }

    pub fn ndcg(&self) -> Option<f64> {
        self.mean(self.ndcg_sum)
    }
}

struct UserScores {
    precision: f64,
    recall: f64,
    ndcg: f64,
}

/// Scores the top-`k` list of every user that has held-out items.
///
/// A user whose recommendations cannot be produced or are malformed is
/// skipped and counted, never scored as zero.
pub fn evaluate<M: Recommender + ?Sized>(
    model: &M,
    train: &CsrMatrix<Flt>,
    test: &CsrMatrix<Flt>,
    config: &EvaluationConfig,
) -> Result<RankingReport, RecError> {
    if config.k == 0 {
        return Err(RecError::InvalidConfig("k must be greater than 0".to_string()));
    }
    if (train.nrows(), train.ncols()) != (test.nrows(), test.ncols()) {
        return Err(RecError::InvalidConfig(format!(
            "train matrix is {}x{} but test matrix is {}x{}",
            train.nrows(),
            train.ncols(),
            test.nrows(),
            test.ncols()
        )));
    }

    let mut report = RankingReport { k: config.k, ..RankingReport::default() };
    for user in process(test.nrows(), config.verbose) {
        let actual = row_items(test, user);
        if actual.is_empty() {
            continue;
        }
        let seen = row_items(train, user);
        match score_user(model, user, seen, actual, test.ncols(), config) {
            Ok(scores) => {
                report.scored_users += 1;
                report.precision_sum += scores.precision;
                report.recall_sum += scores.recall;
                report.ndcg_sum += scores.ndcg;
            }
            Err(e) => {
                debug!(user, error = %e, "skipping user");
                report.skipped_users += 1;
            }
        }
    }

    if report.skipped_users > 0 {
        warn!(skipped = report.skipped_users, "users skipped during evaluation");
    }
    info!(k = config.k, scored = report.scored_users, skipped = report.skipped_users, "evaluated");
    Ok(report)
}

fn score_user<M: Recommender + ?Sized>(
    model: &M,
    user: usize,
    seen: &[usize],
    actual: &[usize],
    no_items: usize,
    config: &EvaluationConfig,
) -> Result<UserScores, RecError> {
    let k = config.k;
    let recommended = model.recommend(user, seen, k, config.filter_seen)?;
    let malformed = |reason: String| RecError::PerUserEvaluation { user, reason };

    if recommended.len() > k {
        return Err(malformed(format!("{} recommendations for k = {}", recommended.len(), k)));
    }
    if let Some(item) = recommended.iter().find(|&&item| item >= no_items) {
        return Err(malformed(format!("item {} is out of range", item)));
    }
    let mut distinct = recommended.clone();
    distinct.sort_unstable();
    distinct.dedup();
    if distinct.len() != recommended.len() {
        return Err(malformed("duplicate items in recommendations".to_string()));
    }
    if config.filter_seen && recommended.iter().any(|item| seen.binary_search(item).is_ok()) {
        return Err(malformed("recommendations include training items".to_string()));
    }

    Ok(UserScores {
        precision: precision_at_k(&recommended, actual, k),
        recall: recall_at_k(&recommended, actual, k),
        ndcg: ndcg_at_k(&recommended, actual, k),
    })
}

/// Root mean squared error over the held-out ratings the model can predict.
pub fn rmse<M: RatingPredictor + ?Sized>(model: &M, test: &CsrMatrix<Flt>) -> Option<f64> {
    let (squared_error, n) = test
        .row_iter()
        .enumerate()
        .flat_map(|(u, row)| {
            row.col_indices()
                .iter()
                .zip(row.values())
                .map(move |(&i, &r)| (u, i, r))
                .collect::<Vec<_>>()
        })
        .filter_map(|(u, i, r)| model.predict_rating(u, i).map(|p| ((p - r) as f64).powi(2)))
        .fold((0.0, 0usize), |(sum, n), e| (sum + e, n + 1));
    (n > 0).then(|| (squared_error / n as f64).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra_sparse::CooMatrix;
    use std::collections::HashMap;

    const EPS: f64 = 1e-9;

    fn matrix(n_users: usize, n_items: usize, entries: &[(usize, usize)]) -> CsrMatrix<Flt> {
        let mut coo = CooMatrix::new(n_users, n_items);
        entries.iter().for_each(|&(u, i)| coo.push(u, i, 1.0));
        CsrMatrix::from(&coo)
    }

    /// Returns canned lists, ignoring the training row.
    struct Canned(HashMap<usize, Vec<usize>>);

    impl Recommender for Canned {
        fn recommend(&self, user: usize, _seen: &[usize], k: usize, _filter_seen: bool) -> Result<Vec<usize>, RecError> {
            self.0
                .get(&user)
                .map(|items| items.iter().take(k).copied().collect())
                .ok_or_else(|| RecError::Backend(format!("no list for user {}", user)))
        }
    }

    struct Fixed(Vec<Vec<Flt>>);

    impl RatingPredictor for Fixed {
        fn predict_rating(&self, user: usize, item: usize) -> Option<Flt> {
            self.0.get(user).and_then(|row| row.get(item)).copied()
        }
    }

    fn config(k: usize) -> EvaluationConfig {
        EvaluationConfig { k, ..EvaluationConfig::default() }
    }

    #[test]
    fn test_no_overlap_scores_zero() {
        assert_eq!(precision_at_k(&[4, 5], &[1, 2], 2), 0.0);
        assert_eq!(recall_at_k(&[4, 5], &[1, 2], 2), 0.0);
        assert_eq!(ndcg_at_k(&[4, 5], &[1, 2], 2), 0.0);
    }

    #[test]
    fn test_precision_uses_k_denominator() {
        assert!((precision_at_k(&[1], &[1, 2], 4) - 0.25).abs() < EPS);
        assert!((recall_at_k(&[1, 9, 2], &[1, 2, 3, 4], 2) - 0.25).abs() < EPS);
    }

    #[test]
    fn test_ndcg_is_one_for_any_order_of_relevant_top_slots() {
        assert!((ndcg_at_k(&[3, 1, 7], &[1, 3], 3) - 1.0).abs() < EPS);
        assert!((ndcg_at_k(&[1, 3, 7], &[1, 3], 3) - 1.0).abs() < EPS);
        assert!((ndcg_at_k(&[5, 6], &[5, 6, 7, 8], 2) - 1.0).abs() < EPS);
    }

    #[test]
    fn test_ndcg_discounts_late_hits() {
        let expected = (1.0 / 3f64.log2()) / 1.0;
        assert!((ndcg_at_k(&[9, 1], &[1], 2) - expected).abs() < EPS);
        assert_eq!(ndcg_at_k(&[1, 2], &[], 2), 0.0);
    }

    #[test]
    fn test_two_user_scenario() {
        // user 0 held out item 1 and kept {0, 2}; user 1 held out its only item
        let train = matrix(2, 4, &[(0, 0), (0, 2)]);
        let test = matrix(2, 4, &[(0, 1), (1, 3)]);
        let model = Canned(HashMap::from([(0, vec![1, 3]), (1, vec![3, 0])]));
        let report = evaluate(&model, &train, &test, &config(2)).unwrap();
        assert_eq!(report.scored_users, 2);

        let user0 = Canned(HashMap::from([(0, vec![1, 3])]));
        let report = evaluate(&user0, &train, &matrix(2, 4, &[(0, 1)]), &config(2)).unwrap();
        assert_eq!(report.scored_users, 1);
        assert!((report.precision().unwrap() - 0.5).abs() < EPS);
        assert!((report.recall().unwrap() - 1.0).abs() < EPS);
        assert!((report.ndcg().unwrap() - 1.0).abs() < EPS);
    }

    #[test]
    fn test_users_without_held_out_items_are_excluded() {
        let train = matrix(3, 3, &[(0, 0), (1, 1), (2, 2)]);
        let test = matrix(3, 3, &[(0, 1)]);
        let model = Canned(HashMap::from([(0, vec![1]), (1, vec![0]), (2, vec![0])]));
        let report = evaluate(&model, &train, &test, &config(1)).unwrap();
        assert_eq!(report.scored_users, 1);
        assert_eq!(report.precision(), Some(1.0));
    }

    #[test]
    fn test_no_eligible_users() {
        let train = matrix(2, 2, &[(0, 0), (1, 1)]);
        let test = CsrMatrix::zeros(2, 2);
        let model = Canned(HashMap::new());
        let report = evaluate(&model, &train, &test, &config(5)).unwrap();
        assert_eq!(report.scored_users, 0);
        assert_eq!(report.skipped_users, 0);
        assert_eq!(report.precision(), None);
        assert_eq!(report.ndcg(), None);
    }

    #[test]
    fn test_failing_users_are_skipped_and_counted() {
        let train = CsrMatrix::zeros(4, 5);
        let test = matrix(4, 5, &[(0, 1), (1, 2), (2, 3), (3, 4)]);
        let model = Canned(HashMap::from([
            (0, vec![1]),       // hit
            (1, vec![7]),       // out of range
            (2, vec![3, 3]),    // duplicate
        ]));
        let report = evaluate(&model, &train, &test, &config(2)).unwrap();
        assert_eq!(report.scored_users, 1);
        assert_eq!(report.skipped_users, 3);
        assert!((report.recall().unwrap() - 1.0).abs() < EPS);
    }

    #[test]
    fn test_seen_items_in_recommendations_are_rejected() {
        let train = matrix(1, 3, &[(0, 0)]);
        let test = matrix(1, 3, &[(0, 1)]);
        let model = Canned(HashMap::from([(0, vec![0, 1])]));
        let report = evaluate(&model, &train, &test, &config(2)).unwrap();
        assert_eq!(report.skipped_users, 1);

        let unfiltered = EvaluationConfig { filter_seen: false, ..config(2) };
        let report = evaluate(&model, &train, &test, &unfiltered).unwrap();
        assert_eq!(report.scored_users, 1);
    }

    #[test]
    fn test_rejects_bad_arguments() {
        let m = matrix(1, 1, &[(0, 0)]);
        let model = Canned(HashMap::new());
        assert!(evaluate(&model, &m, &m, &config(0)).is_err());
        assert!(evaluate(&model, &m, &CsrMatrix::zeros(2, 1), &config(1)).is_err());
    }

    #[test]
    fn test_rmse() {
        let mut coo = CooMatrix::new(2, 2);
        coo.push(0, 0, 4.0);
        coo.push(1, 1, 2.0);
        let test = CsrMatrix::from(&coo);
        let model = Fixed(vec![vec![3.0, 0.0], vec![0.0, 4.0]]);
        let expected = ((1.0 + 4.0) / 2.0f64).sqrt();
        assert!((rmse(&model, &test).unwrap() - expected).abs() < EPS);
        assert_eq!(rmse(&model, &CsrMatrix::zeros(2, 2)), None);
    }
}
