//! Perturbation-radius scheduling: warm-up, smoothed ramp-up, stable phase.
//!
//! The radius is a pure function of the cumulative batch index, so resuming
//! a run at any epoch reproduces exactly the trajectory a fresh run would
//! have produced — the scheduler carries no state beyond its configuration
//! and the batch counter.

use delta_core::{DeltaError, Result};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Scheduler configuration; see [`SmoothedScheduler::new`] for validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub num_epochs: usize,
    /// Target radius in raw data units.
    pub eps: f32,
    /// Per-channel standard deviation of the training data.
    pub std: Array1<f32>,
    /// Whether the training data is pre-normalised; only then does the
    /// normalised view divide by `std`.
    pub normalised: bool,
    pub warm_up_epochs: usize,
    pub ramp_up_epochs: usize,
    pub batches_per_epoch: usize,
    pub start_epoch: usize,
    pub start_kappa: f32,
    pub end_kappa: f32,
    pub start_beta: f32,
    pub end_beta: f32,
    /// Fraction of the ramp window covered by the polynomial segment.
    pub midpoint: f32,
    /// Exponent of the polynomial segment.
    pub exponent: f32,
}

impl SchedulerConfig {
    pub fn new(num_epochs: usize, eps: f32, std: Array1<f32>, normalised: bool) -> Self {
        Self {
            num_epochs,
            eps,
            std,
            normalised,
            warm_up_epochs: 1,
            ramp_up_epochs: 1,
            batches_per_epoch: 1,
            start_epoch: 0,
            start_kappa: 1.0,
            end_kappa: 0.0,
            start_beta: 1.0,
            end_beta: 0.0,
            midpoint: 0.25,
            exponent: 4.0,
        }
    }
}

/// Staged radius scheduler with a smooth ramp: polynomial take-off for the
/// first `midpoint` fraction of the ramp window, then linear to the target.
#[derive(Debug, Clone)]
pub struct SmoothedScheduler {
    cfg: SchedulerConfig,
    warm_batches: usize,
    ramp_batches: usize,
    batch: usize,
}

impl SmoothedScheduler {
    pub fn new(cfg: SchedulerConfig) -> Result<Self> {
        if cfg.warm_up_epochs + cfg.ramp_up_epochs > cfg.num_epochs {
            return Err(DeltaError::InvalidConfig(format!(
                "warm-up ({}) + ramp-up ({}) epochs exceed total epochs ({})",
                cfg.warm_up_epochs, cfg.ramp_up_epochs, cfg.num_epochs
            )));
        }
        if cfg.batches_per_epoch == 0 {
            return Err(DeltaError::InvalidConfig(
                "batches_per_epoch must be positive".into(),
            ));
        }
        if cfg.eps < 0.0 {
            return Err(DeltaError::InvalidConfig(
                "target radius must be non-negative".into(),
            ));
        }
        if cfg.start_epoch > cfg.num_epochs {
            return Err(DeltaError::InvalidConfig(format!(
                "start epoch {} beyond {} epochs",
                cfg.start_epoch, cfg.num_epochs
            )));
        }
        if cfg.std.iter().any(|&s| s <= 0.0) {
            return Err(DeltaError::InvalidConfig(
                "per-channel std must be positive".into(),
            ));
        }
        if !(0.0 < cfg.midpoint && cfg.midpoint <= 1.0) || cfg.exponent < 1.0 {
            return Err(DeltaError::InvalidConfig(
                "midpoint must be in (0, 1] and exponent >= 1".into(),
            ));
        }
        let warm_batches = cfg.warm_up_epochs * cfg.batches_per_epoch;
        let ramp_batches = cfg.ramp_up_epochs * cfg.batches_per_epoch;
        let batch = cfg.start_epoch * cfg.batches_per_epoch;
        Ok(Self {
            cfg,
            warm_batches,
            ramp_batches,
            batch,
        })
    }

    /// Advance to the next batch; the only mutator.
    pub fn batch_step(&mut self) {
        self.batch += 1;
    }

    pub fn batches_elapsed(&self) -> usize {
        self.batch
    }

    /// Radius at cumulative batch `t`, in raw data units.
    fn raw_eps_at(&self, t: usize) -> f32 {
        let w = self.warm_batches;
        let r = self.ramp_batches;
        let target = self.cfg.eps;
        if target == 0.0 || t < w {
            return 0.0;
        }
        if r == 0 || t >= w + r {
            return target;
        }
        let step = t - w;
        let mid_step = ((r as f32) * self.cfg.midpoint) as usize;
        if mid_step == 0 {
            return target * step as f32 / r as f32;
        }
        let exp = self.cfg.exponent;
        let tpow = (mid_step as f32).powf(exp - 1.0);
        let alpha = target / ((r - mid_step) as f32 * exp * tpow + mid_step as f32 * tpow);
        let mid_value = alpha * (mid_step as f32).powf(exp);
        if step <= mid_step {
            alpha * (step as f32).powf(exp)
        } else {
            mid_value + (target - mid_value) * (step - mid_step) as f32 / (r - mid_step) as f32
        }
    }

    fn blend_at(&self, t: usize, start: f32, end: f32) -> f32 {
        let w = self.warm_batches;
        let r = self.ramp_batches;
        if t < w || r == 0 {
            if t >= w + r {
                return end;
            }
            return start;
        }
        if t >= w + r {
            return end;
        }
        start + (end - start) * (t - w) as f32 / r as f32
    }

    fn to_channels(&self, value: f32, normalise: bool) -> Array1<f32> {
        let mut eps = Array1::from_elem(self.cfg.std.len(), value);
        if normalise && self.cfg.normalised {
            eps /= &self.cfg.std;
        }
        eps
    }

    /// Current per-channel radius. `normalise = false` returns raw values
    /// and is the view to use for exact phase comparisons.
    pub fn cur_eps(&self, normalise: bool) -> Array1<f32> {
        self.to_channels(self.raw_eps_at(self.batch), normalise)
    }

    /// Target per-channel radius.
    pub fn max_eps(&self, normalise: bool) -> Array1<f32> {
        self.to_channels(self.cfg.eps, normalise)
    }

    /// Current raw radius as a scalar.
    pub fn cur_eps_raw(&self) -> f32 {
        self.raw_eps_at(self.batch)
    }

    pub fn max_eps_raw(&self) -> f32 {
        self.cfg.eps
    }

    /// Clean/certified blend coefficient.
    pub fn cur_kappa(&self) -> f32 {
        self.blend_at(self.batch, self.cfg.start_kappa, self.cfg.end_kappa)
    }

    /// Blend between the two certified-bound formulations.
    pub fn cur_beta(&self) -> f32 {
        self.blend_at(self.batch, self.cfg.start_beta, self.cfg.end_beta)
    }
}
