use nalgebra_sparse::CsrMatrix;
use ndarray::{Array1, Array2};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::Rng;

use crate::backend::Hyperparameters;
use crate::rightfm::LearningSchedule;
use crate::Flt;

static MAX_REG_SCALE: Flt = 1000000.0;
static MAX_LOSS: Flt = 10.0;

#[derive(Clone, Copy)]
struct Optimizer {
    learning_schedule: LearningSchedule,
    learning_rate: Flt,
    rho: Flt,
    eps: Flt,
}

impl Optimizer {
    /// Applies one gradient step to `weight` and returns the local learning rate.
    #[inline(always)]
    fn step(&self, weight: &mut Flt, accumulator: &mut Flt, momentum: &mut Flt, gradient: Flt, alpha: Flt) -> Flt {
        let local_learning_rate = match self.learning_schedule {
            LearningSchedule::AdaDelta => {
                *accumulator = self.rho * *accumulator + (1.0 - self.rho) * gradient.powi(2);
                let local_learning_rate = (*momentum + self.eps).sqrt() / (*accumulator + self.eps).sqrt();
                let update = local_learning_rate * gradient;
                *momentum = self.rho * *momentum + (1.0 - self.rho) * update.powi(2);
                *weight -= update;
                local_learning_rate
            }
            LearningSchedule::AdaGrad => {
                let local_learning_rate = self.learning_rate / accumulator.sqrt();
                *weight -= local_learning_rate * gradient;
                *accumulator += gradient.powi(2);
                local_learning_rate
            }
        };
        // Lazy regularization: the shrinkage is folded into the table scale.
        *weight *= 1.0 + alpha * local_learning_rate;
        local_learning_rate
    }
}

/// Latent factors and biases for one side of the interaction matrix, with
/// the optimizer state that goes with them.
pub(crate) struct EmbeddingTable {
    pub(crate) weights: Array2<Flt>,
    gradients: Array2<Flt>,
    momentum: Array2<Flt>,
    pub(crate) biases: Array1<Flt>,
    bias_gradients: Array1<Flt>,
    bias_momentum: Array1<Flt>,
    scale: Flt,
}

impl EmbeddingTable {
    fn new<R: Rng>(rows: usize, no_components: usize, schedule: LearningSchedule, rng: &mut R) -> EmbeddingTable {
        let initial_accumulator = match schedule {
            LearningSchedule::AdaGrad => 1.0,
            LearningSchedule::AdaDelta => 0.0,
        };
        EmbeddingTable {
            weights: (Array2::random_using((rows, no_components), Uniform::new(0.0 as Flt, 1.0 as Flt), rng) - 0.5 as Flt)
                / no_components as Flt,
            gradients: Array2::from_elem((rows, no_components), initial_accumulator),
            momentum: Array2::zeros((rows, no_components)),
            biases: Array1::zeros(rows),
            bias_gradients: Array1::from_elem(rows, initial_accumulator),
            bias_momentum: Array1::zeros(rows),
            scale: 1.0,
        }
    }

    pub(crate) fn rows(&self) -> usize {
        self.weights.nrows()
    }

    /// Writes the scaled factors of `row` followed by its bias into `representation`.
    #[inline(always)]
    fn representation(&self, row: usize, representation: &mut [Flt]) {
        let no_components = self.weights.ncols();
        self.weights
            .row(row)
            .iter()
            .zip(representation.iter_mut())
            .for_each(|(w, r)| *r = self.scale * w);
        representation[no_components] = self.scale * self.biases[row];
    }

    #[inline(always)]
    fn update<F: Fn(usize) -> Flt>(
        &mut self,
        row: usize,
        bias_gradient: Flt,
        component_gradient: F,
        optimizer: &Optimizer,
        alpha: Flt,
    ) -> Flt {
        let mut sum_learning_rate = optimizer.step(
            &mut self.biases[row],
            &mut self.bias_gradients[row],
            &mut self.bias_momentum[row],
            bias_gradient,
            alpha,
        );
        for c in 0..self.weights.ncols() {
            sum_learning_rate += optimizer.step(
                &mut self.weights[[row, c]],
                &mut self.gradients[[row, c]],
                &mut self.momentum[[row, c]],
                component_gradient(c),
                alpha,
            );
        }
        sum_learning_rate
    }

    fn regularize(&mut self) {
        let scale = self.scale;
        self.weights.mapv_inplace(|w| w / scale);
        self.biases.mapv_inplace(|b| b / scale);
        self.scale = 1.0;
    }
}

pub(crate) struct FastRightFM {
    pub(crate) items: EmbeddingTable,
    pub(crate) users: EmbeddingTable,
    no_components: usize,
    optimizer: Optimizer,
    item_alpha: Flt,
    user_alpha: Flt,
    max_sampled: usize,
}

impl FastRightFM {
    pub(crate) fn new<R: Rng>(no_users: usize, no_items: usize, params: &Hyperparameters, rng: &mut R) -> FastRightFM {
        let no_components = params.factors;
        FastRightFM {
            items: EmbeddingTable::new(no_items, no_components, params.learning_schedule, rng),
            users: EmbeddingTable::new(no_users, no_components, params.learning_schedule, rng),
            no_components,
            optimizer: Optimizer {
                learning_schedule: params.learning_schedule,
                learning_rate: params.learning_rate,
                rho: params.rho,
                eps: params.epsilon as Flt,
            },
            item_alpha: params.regularization,
            user_alpha: params.regularization,
            max_sampled: params.max_sampled.max(1),
        }
    }

    /// Predicted affinity of `user` for every item.
    pub(crate) fn scores(&self, user: usize) -> Vec<Flt> {
        let user_factors = self.users.weights.row(user);
        let user_bias = self.users.biases[user];
        (self.items.weights.dot(&user_factors) + &self.items.biases + user_bias).to_vec()
    }

    fn representation_len(&self) -> usize {
        self.no_components + 1
    }

    #[inline(always)]
    fn pairwise_update(
        &mut self,
        loss: Flt,
        user: usize,
        positive_item: usize,
        negative_item: usize,
        user_repr: &[Flt],
        pos_it_repr: &[Flt],
        neg_it_repr: &[Flt],
    ) {
        let optimizer = self.optimizer;
        let (item_alpha, user_alpha) = (self.item_alpha, self.user_alpha);
        let mut avg_learning_rate = 0.0;

        avg_learning_rate += self.items.update(positive_item, -loss, |c| -loss * user_repr[c], &optimizer, item_alpha);
        avg_learning_rate += self.items.update(negative_item, loss, |c| loss * user_repr[c], &optimizer, item_alpha);
        avg_learning_rate += self.users.update(
            user,
            loss,
            |c| loss * (neg_it_repr[c] - pos_it_repr[c]),
            &optimizer,
            user_alpha,
        );

        avg_learning_rate /= (3 * (self.no_components + 1)) as Flt;

        self.items.scale *= 1.0 + item_alpha * avg_learning_rate;
        self.users.scale *= 1.0 + user_alpha * avg_learning_rate;
    }

    #[inline(always)]
    fn locked_regularize(&mut self) {
        if self.items.scale > MAX_REG_SCALE || self.users.scale > MAX_REG_SCALE {
            self.regularize();
        }
    }

    fn regularize(&mut self) {
        self.items.regularize();
        self.users.regularize();
    }
}

/// One WARP epoch over the positive interactions, visited in `shuffle_indices`
/// order. Returns the summed loss.
pub(crate) fn fit_warp<R: Rng>(
    interactions: &CsrMatrix<Flt>,
    user_ids: &[usize],
    item_ids: &[usize],
    values: &[Flt],
    shuffle_indices: &[usize],
    rightfm: &mut FastRightFM,
    rng: &mut R,
) -> Flt {
    let no_items = rightfm.items.rows();
    let mut user_repr = vec![0.0; rightfm.representation_len()];
    let mut pos_it_repr = vec![0.0; rightfm.representation_len()];
    let mut neg_it_repr = vec![0.0; rightfm.representation_len()];
    let mut epoch_loss = 0.0;

    for &idx in shuffle_indices {
        if values[idx] <= 0.0 {
            continue;
        }
        let user_id = user_ids[idx];
        let positive_item_id = item_ids[idx];
        let positives = interactions.row(user_id);

        rightfm.items.representation(positive_item_id, &mut pos_it_repr);
        rightfm.users.representation(user_id, &mut user_repr);
        let pos_prediction = compute_prediction_from_repr(&user_repr, &pos_it_repr, rightfm.no_components);

        for sampled in 0..rightfm.max_sampled {
            let negative_item_id = rng.gen_range(0..no_items);
            rightfm.items.representation(negative_item_id, &mut neg_it_repr);
            let neg_prediction = compute_prediction_from_repr(&user_repr, &neg_it_repr, rightfm.no_components);

            if neg_prediction + 1.0 > pos_prediction
                && positives.col_indices().binary_search(&negative_item_id).is_err()
            {
                let loss = ((no_items as Flt - 1.0) / (sampled + 1) as Flt)
                    .floor()
                    .max(1.0)
                    .ln()
                    .min(MAX_LOSS);
                epoch_loss += loss;
                rightfm.pairwise_update(
                    loss,
                    user_id,
                    positive_item_id,
                    negative_item_id,
                    &user_repr,
                    &pos_it_repr,
                    &neg_it_repr,
                );
                break;
            }
        }
        rightfm.locked_regularize();
    }
    rightfm.regularize();
    epoch_loss
}

/// One BPR epoch. Negatives are drawn from the observed item column, so
/// popular items are sampled more often.
pub(crate) fn fit_bpr<R: Rng>(
    interactions: &CsrMatrix<Flt>,
    user_ids: &[usize],
    item_ids: &[usize],
    values: &[Flt],
    shuffle_indices: &[usize],
    rightfm: &mut FastRightFM,
    rng: &mut R,
) -> Flt {
    let no_examples = item_ids.len();
    let mut user_repr = vec![0.0; rightfm.representation_len()];
    let mut pos_it_repr = vec![0.0; rightfm.representation_len()];
    let mut neg_it_repr = vec![0.0; rightfm.representation_len()];
    let mut epoch_loss = 0.0;

    for &idx in shuffle_indices {
        if values[idx] <= 0.0 {
            continue;
        }
        let user_id = user_ids[idx];
        let pos_item_id = item_ids[idx];
        let positives = interactions.row(user_id);

        let negative = (0..no_examples)
            .map(|_| item_ids[rng.gen_range(0..no_examples)])
            .find(|candidate| positives.col_indices().binary_search(candidate).is_err());
        let Some(neg_item_id) = negative else {
            continue;
        };

        rightfm.users.representation(user_id, &mut user_repr);
        rightfm.items.representation(pos_item_id, &mut pos_it_repr);
        rightfm.items.representation(neg_item_id, &mut neg_it_repr);
        let pos_prediction = compute_prediction_from_repr(&user_repr, &pos_it_repr, rightfm.no_components);
        let neg_prediction = compute_prediction_from_repr(&user_repr, &neg_it_repr, rightfm.no_components);
        let loss = 1.0 - sigmoid(pos_prediction - neg_prediction);
        epoch_loss += loss;
        rightfm.pairwise_update(loss, user_id, pos_item_id, neg_item_id, &user_repr, &pos_it_repr, &neg_it_repr);
        rightfm.locked_regularize();
    }
    rightfm.regularize();
    epoch_loss
}

#[inline(always)]
fn compute_prediction_from_repr(user_repr: &[Flt], item_repr: &[Flt], no_components: usize) -> Flt {
    let mut result = user_repr[no_components] + item_repr[no_components];
    for (&u, &i) in user_repr[..no_components].iter().zip(&item_repr[..no_components]) {
        result += u * i;
    }
    result
}

fn sigmoid(x: Flt) -> Flt {
    1.0 / (1.0 + (-x).exp())
}
