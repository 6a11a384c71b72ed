//! Differentiable bound propagation for δ-TRAIN.
//!
//! Certified training needs more from a bound engine than verification
//! does: the bounds must be *differentiable* so the training loss can push
//! them around. This crate provides the feed-forward substrate (affine +
//! ReLU layers over `ndarray`), a concrete forward/backward pass, interval
//! bound propagation with a backward pass through the bound arithmetic, and
//! CROWN-IBP backward linear relaxation for tighter margin bounds.
//!
//! The "original" and "hardened" model of certified training are two views
//! of one [`Network`] value — see the module docs in [`network`].

pub mod bounds;
pub mod crown;
pub mod gemm;
pub mod layers;
pub mod network;

pub use bounds::BoundedBatch;
pub use crown::{crown_ibp_margin_backward, crown_ibp_margin_trace, crown_ibp_margins, CrownTrace};
pub use gemm::matmul_nt;
pub use layers::{Layer, LinearLayer, ReLULayer};
pub use network::{
    BoundGrad, ForwardTrace, Gradients, IbpTrace, LayerGrad, MarginTrace, Network,
};

// Re-export the shared core types for downstream convenience.
pub use delta_core::{DeltaError, Norm, PerturbationSpec, Result};

#[cfg(test)]
mod tests;
