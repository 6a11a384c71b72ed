//! Certified robust training for feed-forward classifiers.
//!
//! Training for *certified* robustness means optimising a worst-case loss
//! derived from sound bounds while a perturbation-radius schedule grows the
//! threat model from nothing to its target. This crate is the orchestration
//! engine around that idea:
//!
//! - [`scheduler`] — the staged radius/blend-coefficient schedule (warm-up,
//!   smoothed ramp-up, stable), resumable at batch resolution;
//! - [`attack`] — deterministic multi-restart PGD used both as a loss term
//!   and as a sub-procedure of the tightened-box methods;
//! - [`loss`] — the method-specific worst-case loss composers (IBP,
//!   CROWN-IBP, MTL-IBP, SABR/TAPS) behind one strategy interface;
//! - [`regularizers`] — ReLU-instability and bound-tightness penalties for
//!   the ramp phase, plus the weight L1 penalty;
//! - [`trainer`] — the epoch/batch loop: learning-rate decay milestones,
//!   gradient clipping, statistics, observer callbacks, checkpointing and
//!   reduced-fidelity early abort;
//! - [`optimizer`], [`data`], [`init`], [`checkpoint`], [`eval`] — the
//!   surrounding machinery.
//!
//! The bound arithmetic itself lives in `delta-propagate`; this crate only
//! asks it for (differentiable) bounds.

pub mod attack;
pub mod checkpoint;
pub mod data;
pub mod eval;
pub mod init;
pub mod loss;
pub mod optimizer;
pub mod regularizers;
pub mod scheduler;
pub mod trainer;

pub use attack::{AdvOutcome, PgdAttack, PgdPolicy};
pub use checkpoint::{CheckpointRecord, CheckpointSink, DirSink};
pub use data::BatchLoader;
pub use eval::{evaluate, EvalReport};
pub use init::ibp_init;
pub use loss::{CertLoss, Composed, ComposeCtx, LossTerms, RadiusPhase, RegSettings};
pub use optimizer::{Adam, ParamGroup};
pub use regularizers::{l1_regulariser, shi_regularisers, RegTerms};
pub use scheduler::{SchedulerConfig, SmoothedScheduler};
pub use trainer::{
    DecayUnit, EpochReport, FitSummary, LogObserver, TrainObserver, Trainer, TrainerConfig,
};

pub use delta_core::{DeltaError, Norm, PerturbationSpec, Result};
pub use delta_propagate::{BoundedBatch, Gradients, Layer, LinearLayer, Network, ReLULayer};
