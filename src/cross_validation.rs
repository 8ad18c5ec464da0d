use nalgebra_sparse::{CooMatrix, CsrMatrix};
use rand::SeedableRng;
use rand_isaac::Isaac64Rng;
use serde::Deserialize;
use shuffle::fy::FisherYates;
use shuffle::shuffler::Shuffler;
use tracing::{info, warn};

use crate::error::RecError;
use crate::Flt;

/// How many of a user's interactions are withheld for testing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HoldOut {
    /// `max(1, floor(n * p))` interactions, `0 < p < 1`.
    Fraction(f64),
    /// A fixed number per user, capped at the user's interaction count.
    Count(usize),
}

impl HoldOut {
    pub fn validate(&self) -> Result<(), RecError> {
        match *self {
            HoldOut::Fraction(p) if !(p > 0.0 && p < 1.0) => Err(RecError::InvalidConfig(format!(
                "held-out fraction must be in (0, 1), got {}",
                p
            ))),
            HoldOut::Count(0) => Err(RecError::InvalidConfig(
                "held-out count must be at least 1".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn test_size(&self, n: usize) -> usize {
        match *self {
            HoldOut::Fraction(p) => ((n as f64 * p).floor() as usize).max(1).min(n),
            HoldOut::Count(c) => c.min(n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitMode {
    Fraction,
    Count,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub mode: SplitMode,
    pub fraction: f64,
    pub count: usize,
    /// Users with fewer interactions keep all of them in train.
    pub min_interactions: usize,
    pub seed: Option<u64>,
}

impl Default for SplitConfig {
    fn default() -> Self {
        SplitConfig {
            mode: SplitMode::Fraction,
            fraction: 0.1,
            count: 1,
            min_interactions: 1,
            seed: Some(42),
        }
    }
}

impl SplitConfig {
    pub fn hold_out(&self) -> HoldOut {
        match self.mode {
            SplitMode::Fraction => HoldOut::Fraction(self.fraction),
            SplitMode::Count => HoldOut::Count(self.count),
        }
    }
}

#[derive(Debug)]
pub struct TrainTestSplit {
    pub train: CsrMatrix<Flt>,
    pub test: CsrMatrix<Flt>,
    /// Users with at least one held-out interaction.
    pub held_out_users: usize,
    /// Users whose only interaction went to test, leaving them nothing to train on.
    pub single_interaction_users: usize,
}

/// Moves a random subset of every user's interactions into a test matrix.
///
/// The subset is drawn without replacement from the user's row. The same
/// seed and input always produce the same split.
pub fn random_train_test_split(
    interactions: &CsrMatrix<Flt>,
    hold_out: HoldOut,
    min_interactions: usize,
    random_seed: Option<u64>,
) -> Result<TrainTestSplit, RecError> {
    hold_out.validate()?;
    let mut rng = match random_seed {
        Some(seed) => Isaac64Rng::seed_from_u64(seed),
        None => Isaac64Rng::from_entropy(),
    };
    let mut fy = FisherYates::default();

    let (n_users, n_items) = (interactions.nrows(), interactions.ncols());
    let mut train = CooMatrix::new(n_users, n_items);
    let mut test = CooMatrix::new(n_users, n_items);
    let mut held_out_users = 0;
    let mut single_interaction_users = 0;

    for (user, row) in interactions.row_iter().enumerate() {
        let n = row.nnz();
        if n == 0 {
            continue;
        }
        let (cols, values) = (row.col_indices(), row.values());
        if n < min_interactions.max(1) {
            cols.iter().zip(values).for_each(|(&i, &v)| train.push(user, i, v));
            continue;
        }

        let mut positions = (0..n).collect::<Vec<_>>();
        fy.shuffle(&mut positions, &mut rng)
            .map_err(|e| RecError::InvalidConfig(format!("shuffle failed: {}", e)))?;
        let test_size = hold_out.test_size(n);
        let (to_test, to_train) = positions.split_at(test_size);
        to_test.iter().for_each(|&p| test.push(user, cols[p], values[p]));
        to_train.iter().for_each(|&p| train.push(user, cols[p], values[p]));

        held_out_users += 1;
        if to_train.is_empty() {
            single_interaction_users += 1;
        }
    }

    let split = TrainTestSplit {
        train: CsrMatrix::from(&train),
        test: CsrMatrix::from(&test),
        held_out_users,
        single_interaction_users,
    };
    info!(
        train = split.train.nnz(),
        test = split.test.nnz(),
        held_out_users,
        "split interactions"
    );
    if single_interaction_users > 0 {
        warn!(
            users = single_interaction_users,
            "users lost their only training interaction to the test set"
        );
    }
    Ok(split)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_ok::assert_ok;

    fn matrix(n_users: usize, n_items: usize, entries: &[(usize, usize)]) -> CsrMatrix<Flt> {
        let mut coo = CooMatrix::new(n_users, n_items);
        entries.iter().for_each(|&(u, i)| coo.push(u, i, 1.0));
        CsrMatrix::from(&coo)
    }

    fn dense_matrix(n_users: usize, n_items: usize) -> CsrMatrix<Flt> {
        let entries: Vec<_> = (0..n_users)
            .flat_map(|u| (0..n_items).filter(move |i| (u * 7 + i * 3) % 4 != 0).map(move |i| (u, i)))
            .collect();
        matrix(n_users, n_items, &entries)
    }

    #[test]
    fn test_test_size() {
        assert_eq!(HoldOut::Fraction(0.1).test_size(5), 1);
        assert_eq!(HoldOut::Fraction(0.1).test_size(25), 2);
        assert_eq!(HoldOut::Fraction(0.5).test_size(3), 1);
        assert_eq!(HoldOut::Count(3).test_size(2), 2);
        assert_eq!(HoldOut::Count(3).test_size(10), 3);
    }

    #[test]
    fn test_rejects_invalid_hold_out() {
        let m = matrix(1, 1, &[(0, 0)]);
        assert!(random_train_test_split(&m, HoldOut::Fraction(0.0), 1, Some(1)).is_err());
        assert!(random_train_test_split(&m, HoldOut::Fraction(1.0), 1, Some(1)).is_err());
        assert!(random_train_test_split(&m, HoldOut::Count(0), 1, Some(1)).is_err());
    }

    #[test]
    fn test_partition_preserves_every_position() {
        let m = dense_matrix(30, 17);
        let split = assert_ok!(random_train_test_split(&m, HoldOut::Fraction(0.2), 1, Some(7)));
        for user in 0..m.nrows() {
            let source = m.row(user);
            let train = split.train.row(user);
            let test = split.test.row(user);
            assert_eq!(train.nnz() + test.nnz(), source.nnz());
            assert_eq!(test.nnz(), HoldOut::Fraction(0.2).test_size(source.nnz()));
            let mut union: Vec<usize> = train.col_indices().iter().chain(test.col_indices()).copied().collect();
            union.sort_unstable();
            assert_eq!(union, source.col_indices());
        }
    }

    #[test]
    fn test_same_seed_same_split() {
        let m = dense_matrix(20, 25);
        let a = random_train_test_split(&m, HoldOut::Fraction(0.3), 1, Some(42)).unwrap();
        let b = random_train_test_split(&m, HoldOut::Fraction(0.3), 1, Some(42)).unwrap();
        assert_eq!(a.train, b.train);
        assert_eq!(a.test, b.test);
    }

    #[test]
    fn test_two_user_scenario() {
        let m = matrix(2, 4, &[(0, 0), (0, 1), (0, 2), (1, 3)]);
        let split = random_train_test_split(&m, HoldOut::Fraction(0.5), 1, Some(3)).unwrap();
        assert_eq!(split.test.row(0).nnz(), 1);
        assert_eq!(split.train.row(0).nnz(), 2);
        assert_eq!(split.test.row(1).col_indices(), &[3]);
        assert_eq!(split.train.row(1).nnz(), 0);
        assert_eq!(split.held_out_users, 2);
        assert_eq!(split.single_interaction_users, 1);
    }

    #[test]
    fn test_min_interactions_keeps_small_users_in_train() {
        let m = matrix(2, 3, &[(0, 0), (0, 1), (1, 2)]);
        let split = random_train_test_split(&m, HoldOut::Count(1), 2, Some(0)).unwrap();
        assert_eq!(split.test.row(0).nnz(), 1);
        assert_eq!(split.train.row(1).col_indices(), &[2]);
        assert_eq!(split.test.row(1).nnz(), 0);
        assert_eq!(split.single_interaction_users, 0);
    }

    #[test]
    fn test_values_carried_over() {
        let mut coo = CooMatrix::new(1, 2);
        coo.push(0, 0, 4.0);
        coo.push(0, 1, 2.0);
        let m = CsrMatrix::from(&coo);
        let split = random_train_test_split(&m, HoldOut::Count(1), 1, Some(11)).unwrap();
        let held = split.test.row(0);
        let expected = if held.col_indices()[0] == 0 { 4.0 } else { 2.0 };
        assert_eq!(held.values(), &[expected]);
    }
}
