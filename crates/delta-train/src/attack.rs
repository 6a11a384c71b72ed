//! Multi-restart projected gradient ascent inside a perturbation box.
//!
//! The search is deterministic for a fixed seed: restart `r` derives its
//! RNG from `seed.wrapping_add(r)`, restarts run sequentially, and the
//! per-example worst case is tracked across all restarts. Restart 0 starts
//! from the clean input (projected into the box), so a zero-step search
//! returns exactly the clean loss; later restarts start from uniform
//! samples of the box.

use crate::loss::{cross_entropy, misclassified_fraction, softmax_minus_onehot};
use delta_propagate::{BoundedBatch, Network};
use delta_core::Result;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::Range;
use tracing::trace;

/// Step/restart/decay policy of the search.
#[derive(Debug, Clone)]
pub struct PgdPolicy {
    pub restarts: usize,
    pub n_steps: usize,
    /// Step length relative to the box half-width.
    pub step_size: f32,
    /// Multiplier applied to the step size at each decay checkpoint.
    pub decay_factor: f32,
    /// 1-based step indices at which the step size decays.
    pub decay_checkpoints: Vec<usize>,
    /// Freeze an example as soon as the current restart misclassifies it.
    pub early_stopping: bool,
}

impl Default for PgdPolicy {
    fn default() -> Self {
        Self {
            restarts: 1,
            n_steps: 8,
            step_size: 0.5,
            decay_factor: 0.1,
            decay_checkpoints: vec![4, 7],
            early_stopping: false,
        }
    }
}

/// Per-example worst case found by the search.
#[derive(Debug, Clone)]
pub struct AdvOutcome {
    pub adv_inputs: Array2<f32>,
    pub adv_logits: Array2<f32>,
    /// Per-example cross-entropy at the worst case.
    pub adv_loss: Array1<f32>,
    /// Fraction of the batch misclassified at the worst case.
    pub adv_err: f32,
}

/// PGD attacker; construct once per batch with the batch's seed.
#[derive(Debug, Clone)]
pub struct PgdAttack {
    policy: PgdPolicy,
    seed: u64,
}

impl PgdAttack {
    pub fn new(policy: PgdPolicy, seed: u64) -> Self {
        Self { policy, seed }
    }

    /// Search the whole network.
    pub fn attack(
        &self,
        network: &Network,
        input: &Array2<f32>,
        region: &BoundedBatch,
        labels: &[usize],
    ) -> Result<AdvOutcome> {
        self.attack_range(network, 0..network.len(), input, region, labels)
    }

    /// Search a sub-network: `start_point` and `region` live in the input
    /// space of `range.start` (used by the split-network method to attack
    /// the classifier block from a latent box).
    pub fn attack_range(
        &self,
        network: &Network,
        range: Range<usize>,
        start_point: &Array2<f32>,
        region: &BoundedBatch,
        labels: &[usize],
    ) -> Result<AdvOutcome> {
        let batch = start_point.nrows();
        let radius = region.radius();

        let mut best_inputs = project(start_point, region);
        let mut best_loss = Array1::from_elem(batch, f32::NEG_INFINITY);

        for restart in 0..self.policy.restarts.max(1) {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(restart as u64));
            let mut x = if restart == 0 {
                project(start_point, region)
            } else {
                sample_uniform(region, &mut rng)
            };

            let mut step_scale = self.policy.step_size;
            let mut active = vec![true; batch];

            for step in 1..=self.policy.n_steps {
                if self.policy.decay_checkpoints.contains(&step) {
                    step_scale *= self.policy.decay_factor;
                }

                let trace = network.forward_trace_range(&x, range.clone())?;
                if self.policy.early_stopping {
                    for (i, &y) in labels.iter().enumerate() {
                        if active[i] && argmax(&trace.output, i) != y {
                            active[i] = false;
                        }
                    }
                    if active.iter().all(|a| !a) {
                        break;
                    }
                }

                let grad_logits = softmax_minus_onehot(&trace.output, labels);
                let (_, grad_input) = network.backward(&trace, &grad_logits);

                for i in 0..batch {
                    if !active[i] {
                        continue;
                    }
                    for j in 0..x.ncols() {
                        let g = grad_input[[i, j]];
                        x[[i, j]] += step_scale * radius[[i, j]] * g.signum();
                        x[[i, j]] = x[[i, j]].clamp(region.lower[[i, j]], region.upper[[i, j]]);
                    }
                }
            }

            let logits = network.forward_trace_range(&x, range.clone())?.output;
            let loss = cross_entropy(&logits, labels);
            for i in 0..batch {
                if loss[i] > best_loss[i] {
                    best_loss[i] = loss[i];
                    for j in 0..x.ncols() {
                        best_inputs[[i, j]] = x[[i, j]];
                    }
                }
            }
            trace!(restart, "pgd restart complete");
        }

        let adv_logits = network
            .forward_trace_range(&best_inputs, range.clone())?
            .output;
        let adv_loss = cross_entropy(&adv_logits, labels);
        let adv_err = misclassified_fraction(&adv_logits, labels);
        Ok(AdvOutcome {
            adv_inputs: best_inputs,
            adv_logits,
            adv_loss,
            adv_err,
        })
    }
}

fn argmax(logits: &Array2<f32>, row: usize) -> usize {
    let mut best = 0;
    let mut best_v = f32::NEG_INFINITY;
    for (j, &v) in logits.row(row).iter().enumerate() {
        if v > best_v {
            best_v = v;
            best = j;
        }
    }
    best
}

fn project(x: &Array2<f32>, region: &BoundedBatch) -> Array2<f32> {
    let mut out = x.clone();
    out.zip_mut_with(&region.lower, |v, &l| {
        if *v < l {
            *v = l;
        }
    });
    out.zip_mut_with(&region.upper, |v, &u| {
        if *v > u {
            *v = u;
        }
    });
    out
}

fn sample_uniform(region: &BoundedBatch, rng: &mut StdRng) -> Array2<f32> {
    let mut out = region.lower.clone();
    for (v, (&l, &u)) in out
        .iter_mut()
        .zip(region.lower.iter().zip(region.upper.iter()))
    {
        *v = if u > l { rng.random_range(l..=u) } else { l };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use delta_propagate::{Layer, LinearLayer, ReLULayer};
    use ndarray::{arr1, arr2};

    fn toy_network() -> Network {
        let mut network = Network::new();
        network.add_layer(Layer::Linear(
            LinearLayer::new(
                arr2(&[[1.0, 0.5], [-0.5, 1.0]]),
                Some(arr1(&[0.1, -0.1])),
            )
            .unwrap(),
        ));
        network.add_layer(Layer::ReLU(ReLULayer));
        network.add_layer(Layer::Linear(
            LinearLayer::new(arr2(&[[1.0, -1.0], [0.5, 0.5]]), None).unwrap(),
        ));
        network
    }

    #[test]
    fn test_zero_steps_single_restart_is_clean() {
        let network = toy_network();
        let x = arr2(&[[0.5, 0.2], [-0.3, 0.9]]);
        let labels = [0usize, 1];
        let region = BoundedBatch::new(&x - 0.1, &x + 0.1).unwrap();

        let policy = PgdPolicy {
            restarts: 1,
            n_steps: 0,
            ..PgdPolicy::default()
        };
        let outcome = PgdAttack::new(policy, 7)
            .attack(&network, &x, &region, &labels)
            .unwrap();

        let clean = network.forward(&x).unwrap();
        for (a, c) in outcome.adv_logits.iter().zip(clean.iter()) {
            assert!((a - c).abs() < 1e-6);
        }
        let clean_loss = cross_entropy(&clean, &labels);
        for (a, c) in outcome.adv_loss.iter().zip(clean_loss.iter()) {
            assert!((a - c).abs() < 1e-6);
        }
    }

    #[test]
    fn test_iterates_stay_in_region() {
        let network = toy_network();
        let x = arr2(&[[0.5, 0.2]]);
        let labels = [0usize];
        let region = BoundedBatch::new(&x - 0.05, &x + 0.05).unwrap();

        let policy = PgdPolicy {
            restarts: 3,
            n_steps: 10,
            step_size: 1.0,
            ..PgdPolicy::default()
        };
        let outcome = PgdAttack::new(policy, 3)
            .attack(&network, &x, &region, &labels)
            .unwrap();
        assert!(region.contains(&outcome.adv_inputs));
    }

    #[test]
    fn test_attack_never_below_clean_loss() {
        // Restart 0 starts at the clean point, so the per-example worst
        // case can only be at least as bad.
        let network = toy_network();
        let x = arr2(&[[0.5, 0.2], [0.1, -0.6]]);
        let labels = [1usize, 0];
        let region = BoundedBatch::new(&x - 0.1, &x + 0.1).unwrap();

        let policy = PgdPolicy {
            restarts: 2,
            n_steps: 5,
            step_size: 0.25,
            ..PgdPolicy::default()
        };
        let outcome = PgdAttack::new(policy, 11)
            .attack(&network, &x, &region, &labels)
            .unwrap();
        let clean_loss = cross_entropy(&network.forward(&x).unwrap(), &labels);
        for i in 0..2 {
            assert!(outcome.adv_loss[i] >= clean_loss[i] - 1e-6);
        }
    }

    #[test]
    fn test_deterministic_for_fixed_seed() {
        let network = toy_network();
        let x = arr2(&[[0.5, 0.2]]);
        let labels = [0usize];
        let region = BoundedBatch::new(&x - 0.1, &x + 0.1).unwrap();
        let policy = PgdPolicy {
            restarts: 4,
            n_steps: 6,
            ..PgdPolicy::default()
        };

        let a = PgdAttack::new(policy.clone(), 42)
            .attack(&network, &x, &region, &labels)
            .unwrap();
        let b = PgdAttack::new(policy, 42)
            .attack(&network, &x, &region, &labels)
            .unwrap();
        assert_eq!(a.adv_inputs, b.adv_inputs);
        assert_eq!(a.adv_loss, b.adv_loss);
    }

    #[test]
    fn test_latent_range_attack() {
        let network = toy_network();
        // Latent space of the tail block (after layer 1) is 2-dimensional.
        let z = arr2(&[[0.4, 0.6]]);
        let labels = [0usize];
        let region = BoundedBatch::new(&z - 0.2, &z + 0.2).unwrap();
        let policy = PgdPolicy {
            restarts: 2,
            n_steps: 4,
            ..PgdPolicy::default()
        };
        let outcome = PgdAttack::new(policy, 5)
            .attack_range(&network, 2..3, &z, &region, &labels)
            .unwrap();
        assert_eq!(outcome.adv_logits.dim(), (1, 2));
        assert!(region.contains(&outcome.adv_inputs));
    }
}
