//! The epoch/batch training loop.
//!
//! The loop itself is method-agnostic: it reads the scheduled radius and
//! blend coefficients, builds the perturbation specification, hands the
//! batch to the configured [`CertLoss`] strategy, and applies clipping and
//! the optimizer step. Progress reporting goes through an injected
//! [`TrainObserver`] rather than prints, and checkpoint failures are
//! surfaced without aborting the epoch already completed in memory.

use crate::checkpoint::{CheckpointRecord, CheckpointSink};
use crate::data::BatchLoader;
use crate::init::ibp_init;
use crate::loss::{CertLoss, ComposeCtx, LossTerms, RadiusPhase, RegSettings};
use crate::optimizer::Adam;
use crate::scheduler::{SchedulerConfig, SmoothedScheduler};
use delta_core::{DeltaError, PerturbationSpec, Result};
use delta_propagate::Network;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Granularity of the learning-rate decay milestones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecayUnit {
    /// Milestones are 1-based epoch numbers.
    Epoch,
    /// Milestones are 1-based cumulative batch numbers.
    Batch,
}

/// Training-loop configuration.
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub num_epochs: usize,
    /// Resume point; 0 means a fresh run (weights are re-initialised).
    pub start_epoch: usize,
    /// Optional truncation point, clamped to `num_epochs`.
    pub end_epoch: Option<usize>,
    /// Target perturbation radius in raw data units.
    pub eps: f32,
    pub warm_up_epochs: usize,
    pub ramp_up_epochs: usize,
    pub lr: f32,
    pub lr_decay_milestones: Vec<usize>,
    pub lr_decay_factor: f32,
    pub lr_decay_unit: DecayUnit,
    /// Gradient-value clip applied to every parameter gradient.
    pub gradient_clip: Option<f32>,
    pub reg: RegSettings,
    /// Reduced-fidelity early abort: stop once this fraction of the target
    /// radius is reached by the schedule.
    pub multi_fidelity_train_eps: Option<f32>,
    pub start_kappa: f32,
    pub end_kappa: f32,
    pub start_beta: f32,
    pub end_beta: f32,
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            num_epochs: 5,
            start_epoch: 0,
            end_epoch: None,
            eps: 0.1,
            warm_up_epochs: 1,
            ramp_up_epochs: 2,
            lr: 5e-4,
            lr_decay_milestones: Vec::new(),
            lr_decay_factor: 0.2,
            lr_decay_unit: DecayUnit::Epoch,
            gradient_clip: Some(10.0),
            reg: RegSettings::default(),
            multi_fidelity_train_eps: None,
            start_kappa: 1.0,
            end_kappa: 0.0,
            start_beta: 1.0,
            end_beta: 0.0,
            seed: 42,
        }
    }
}

/// Per-epoch metrics handed to the observer.
#[derive(Debug, Clone)]
pub struct EpochReport {
    pub epoch: usize,
    pub num_epochs: usize,
    /// Scheduled radius at the start of the epoch, raw units.
    pub eps_raw: f32,
    pub train_loss: f32,
    pub nat_acc: f32,
    pub cert_acc: Option<f32>,
    pub adv_acc: Option<f32>,
    pub lr: f32,
    /// Set when the end-of-epoch checkpoint write failed.
    pub checkpoint_error: Option<String>,
}

/// Structured progress callbacks, invoked at batch and epoch boundaries.
pub trait TrainObserver {
    fn on_epoch_start(&mut self, _epoch: usize, _eps: &Array1<f32>, _kappa: f32) {}
    fn on_batch(&mut self, _epoch: usize, _batch: usize, _terms: &LossTerms) {}
    fn on_epoch_end(&mut self, _report: &EpochReport) {}
}

/// Default observer: logs epoch summaries through `tracing`.
#[derive(Debug, Default)]
pub struct LogObserver;

impl TrainObserver for LogObserver {
    fn on_epoch_start(&mut self, epoch: usize, eps: &Array1<f32>, kappa: f32) {
        info!(epoch = epoch + 1, ?eps, kappa, "epoch start");
    }

    fn on_epoch_end(&mut self, report: &EpochReport) {
        info!(
            "Epoch [{}/{}], Train Loss: {:.4}",
            report.epoch + 1,
            report.num_epochs,
            report.train_loss
        );
        info!("\t Natural Acc. Train: {:.4}", report.nat_acc);
        match report.adv_acc {
            Some(a) => info!("\t Adv. Acc. Train: {:.4}", a),
            None => info!("\t Adv. Acc. Train: N/A"),
        }
        match report.cert_acc {
            Some(c) => info!("\t Certified Acc. Train: {:.4}", c),
            None => info!("\t Certified Acc. Train: N/A"),
        }
    }
}

/// Outcome of a training call.
#[derive(Debug, Clone)]
pub struct FitSummary {
    pub epochs_completed: usize,
    pub aborted_early: bool,
    pub final_loss: f32,
}

/// Owns the model pair and the optimizer for the duration of training.
pub struct Trainer {
    network: Network,
    optimizer: Adam,
    strategy: CertLoss,
    cfg: TrainerConfig,
}

impl Trainer {
    pub fn new(network: Network, strategy: CertLoss, cfg: TrainerConfig) -> Result<Self> {
        strategy.validate(&network)?;
        if cfg.lr <= 0.0 {
            return Err(DeltaError::InvalidConfig(
                "learning rate must be positive".into(),
            ));
        }
        if cfg.lr_decay_factor <= 0.0 {
            return Err(DeltaError::InvalidConfig(
                "learning-rate decay factor must be positive".into(),
            ));
        }
        let optimizer = Adam::new(&network, cfg.lr);
        Ok(Self {
            network,
            optimizer,
            strategy,
            cfg,
        })
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn into_network(self) -> Network {
        self.network
    }

    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    /// Restore model and optimizer state from a checkpoint record.
    pub fn restore(&mut self, record: CheckpointRecord) {
        self.network = record.model;
        self.optimizer = record.optimizer;
    }

    fn validate_milestones(&self, batches_per_epoch: usize) -> Result<()> {
        let limit = match self.cfg.lr_decay_unit {
            DecayUnit::Epoch => self.cfg.num_epochs,
            DecayUnit::Batch => self.cfg.num_epochs * batches_per_epoch,
        };
        if let Some(&m) = self
            .cfg
            .lr_decay_milestones
            .iter()
            .find(|&&m| m == 0 || m > limit)
        {
            return Err(DeltaError::InvalidConfig(format!(
                "decay milestone {} outside 1..={} for {:?} granularity",
                m, limit, self.cfg.lr_decay_unit
            )));
        }
        Ok(())
    }

    /// Run the training loop over `loader`, reporting through `observer`
    /// and checkpointing into `sink` when provided.
    pub fn fit(
        &mut self,
        loader: &BatchLoader,
        observer: &mut dyn TrainObserver,
        sink: Option<&dyn CheckpointSink>,
    ) -> Result<FitSummary> {
        let bpe = loader.batches_per_epoch();
        if self.network.in_features()? != loader.features() {
            return Err(DeltaError::ShapeMismatch {
                expected: vec![self.network.in_features()?],
                got: vec![loader.features()],
            });
        }
        self.validate_milestones(bpe)?;

        let mut sched_cfg = SchedulerConfig::new(
            self.cfg.num_epochs,
            self.cfg.eps,
            loader.std.clone(),
            loader.normalised,
        );
        sched_cfg.warm_up_epochs = self.cfg.warm_up_epochs;
        sched_cfg.ramp_up_epochs = self.cfg.ramp_up_epochs;
        sched_cfg.batches_per_epoch = bpe;
        sched_cfg.start_epoch = self.cfg.start_epoch;
        sched_cfg.start_kappa = self.cfg.start_kappa;
        sched_cfg.end_kappa = self.cfg.end_kappa;
        sched_cfg.start_beta = self.cfg.start_beta;
        sched_cfg.end_beta = self.cfg.end_beta;
        let mut sched = SmoothedScheduler::new(sched_cfg)?;

        if self.cfg.start_epoch == 0 {
            ibp_init(&mut self.network, self.cfg.seed)?;
        }

        let end_epoch = self
            .cfg
            .end_epoch
            .unwrap_or(self.cfg.num_epochs)
            .min(self.cfg.num_epochs);
        let mut no_batches = self.cfg.start_epoch * bpe;
        let mut aborted_early = false;
        let mut epochs_completed = 0;
        let mut final_loss = 0.0;

        for epoch in self.cfg.start_epoch..end_epoch {
            if let Some(f) = self.cfg.multi_fidelity_train_eps {
                if f < 1.0 && f * sched.max_eps_raw() <= sched.cur_eps_raw() {
                    info!(epoch, "reduced-fidelity radius reached, stopping early");
                    aborted_early = true;
                    break;
                }
            }

            if self.cfg.lr_decay_unit == DecayUnit::Epoch
                && self.cfg.lr_decay_milestones.contains(&(epoch + 1))
            {
                self.optimizer.decay_lr(self.cfg.lr_decay_factor);
                info!(lr = self.optimizer.lr(), "learning rate decayed");
            }

            let eps_raw_at_start = sched.cur_eps_raw();
            observer.on_epoch_start(epoch, &sched.cur_eps(true), sched.cur_kappa());

            let mut running_loss = 0.0;
            let mut nat_sum = 0.0;
            let mut rob_sum = 0.0;
            let mut adv_sum = 0.0;
            let mut rob_seen = false;
            let mut adv_seen = false;

            for (batch_idx, (x, labels)) in loader.iter().enumerate() {
                if self.cfg.lr_decay_unit == DecayUnit::Batch
                    && self.cfg.lr_decay_milestones.contains(&(no_batches + 1))
                {
                    self.optimizer.decay_lr(self.cfg.lr_decay_factor);
                    info!(lr = self.optimizer.lr(), "learning rate decayed");
                }

                let eps_vec = sched.cur_eps(true);
                let spec = PerturbationSpec::linf(&x, &eps_vec, &loader.min, &loader.max)?;

                let cur_raw = sched.cur_eps_raw();
                let max_raw = sched.max_eps_raw();
                let phase = if cur_raw == 0.0 {
                    RadiusPhase::Zero
                } else if cur_raw == max_raw {
                    RadiusPhase::Stable
                } else {
                    RadiusPhase::Ramp
                };
                let eps_ratio = if max_raw > 0.0 { cur_raw / max_raw } else { 1.0 };

                let composed = self.strategy.compose(&ComposeCtx {
                    network: &self.network,
                    input: &x,
                    labels,
                    spec: &spec,
                    eps: &eps_vec,
                    data_min: &loader.min,
                    data_max: &loader.max,
                    phase,
                    kappa: sched.cur_kappa(),
                    beta: sched.cur_beta(),
                    eps_ratio,
                    reg: &self.cfg.reg,
                    seed: self.cfg.seed.wrapping_add(no_batches as u64),
                })?;

                let mut grads = composed.grads;
                if let Some(clip) = self.cfg.gradient_clip {
                    grads.clip_values(clip);
                }
                self.optimizer.step(&mut self.network, &grads)?;

                running_loss += composed.terms.total;
                nat_sum += composed.nat_err;
                if let Some(r) = composed.rob_err {
                    rob_sum += r;
                    rob_seen = true;
                }
                if let Some(a) = composed.adv_err {
                    adv_sum += a;
                    adv_seen = true;
                }

                observer.on_batch(epoch, batch_idx, &composed.terms);
                sched.batch_step();
                no_batches += 1;
            }

            let mut report = EpochReport {
                epoch,
                num_epochs: self.cfg.num_epochs,
                eps_raw: eps_raw_at_start,
                train_loss: running_loss / bpe as f32,
                nat_acc: 1.0 - nat_sum / bpe as f32,
                cert_acc: rob_seen.then(|| 1.0 - rob_sum / bpe as f32),
                adv_acc: adv_seen.then(|| 1.0 - adv_sum / bpe as f32),
                lr: self.optimizer.lr(),
                checkpoint_error: None,
            };

            if let Some(sink) = sink {
                let record = CheckpointRecord {
                    epoch: epoch + 1,
                    running_loss,
                    model: self.network.clone(),
                    optimizer: self.optimizer.clone(),
                };
                if let Err(e) = sink.save(&record) {
                    warn!(epoch = epoch + 1, error = %e, "checkpoint write failed");
                    report.checkpoint_error = Some(e.to_string());
                }
            }

            observer.on_epoch_end(&report);
            final_loss = report.train_loss;
            epochs_completed += 1;
        }

        Ok(FitSummary {
            epochs_completed,
            aborted_early,
            final_loss,
        })
    }
}
