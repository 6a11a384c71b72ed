//! Adam over the network's parameter store.
//!
//! One parameter group per affine layer, each with its own mutable learning
//! rate; decays apply to every group and are recorded in a learning-rate
//! history so a run's decay schedule can be audited after the fact. The
//! moment buffers serialise with the optimizer, making checkpoints exact.

use delta_core::{DeltaError, Result};
use delta_propagate::{Gradients, Layer, LayerGrad, Network};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// One parameter group: the affine layer at `layer` with its learning rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamGroup {
    pub layer: usize,
    pub lr: f32,
}

/// Adam with per-group learning rates and recorded decay history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adam {
    groups: Vec<ParamGroup>,
    beta1: f32,
    beta2: f32,
    eps: f32,
    t: u64,
    m: Vec<Option<LayerGrad>>,
    v: Vec<Option<LayerGrad>>,
    lr_history: Vec<f32>,
}

impl Adam {
    pub fn new(network: &Network, lr: f32) -> Self {
        let groups = network
            .layers
            .iter()
            .enumerate()
            .filter_map(|(i, l)| match l {
                Layer::Linear(_) => Some(ParamGroup { layer: i, lr }),
                Layer::ReLU(_) => None,
            })
            .collect();
        let zeros = |network: &Network| -> Vec<Option<LayerGrad>> {
            network
                .layers
                .iter()
                .map(|l| match l {
                    Layer::Linear(lin) => Some(LayerGrad {
                        d_weight: Array2::zeros(lin.weight.dim()),
                        d_bias: Array1::zeros(lin.bias.len()),
                    }),
                    Layer::ReLU(_) => None,
                })
                .collect()
        };
        Self {
            groups,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            m: zeros(network),
            v: zeros(network),
            lr_history: vec![lr],
        }
    }

    /// Current learning rate (of the last group, as conventional).
    pub fn lr(&self) -> f32 {
        self.groups.last().map(|g| g.lr).unwrap_or(0.0)
    }

    /// Multiply every group's learning rate; records the new value.
    pub fn decay_lr(&mut self, factor: f32) {
        for g in &mut self.groups {
            g.lr *= factor;
        }
        let lr = self.lr();
        self.lr_history.push(lr);
    }

    /// Initial learning rate plus every decayed value, in order.
    pub fn lr_history(&self) -> &[f32] {
        &self.lr_history
    }

    pub fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    /// A zeroed gradient buffer matching the parameter store.
    pub fn zero_grad(&self, network: &Network) -> Gradients {
        Gradients::zeros(network)
    }

    /// One Adam update over every parameter group.
    pub fn step(&mut self, network: &mut Network, grads: &Gradients) -> Result<()> {
        if grads.layers.len() != network.layers.len() {
            return Err(DeltaError::ShapeMismatch {
                expected: vec![network.layers.len()],
                got: vec![grads.layers.len()],
            });
        }
        self.t += 1;
        let t = self.t as f32;
        let bc1 = 1.0 - self.beta1.powf(t);
        let bc2 = 1.0 - self.beta2.powf(t);

        for group in &self.groups {
            let idx = group.layer;
            let lin = match &mut network.layers[idx] {
                Layer::Linear(lin) => lin,
                Layer::ReLU(_) => continue,
            };
            let (Some(g), Some(m), Some(v)) = (
                grads.layers[idx].as_ref(),
                self.m[idx].as_mut(),
                self.v[idx].as_mut(),
            ) else {
                continue;
            };

            let lr = group.lr;
            let (b1, b2, eps) = (self.beta1, self.beta2, self.eps);

            for ((w, gw), (mw, vw)) in lin
                .weight
                .iter_mut()
                .zip(g.d_weight.iter())
                .zip(m.d_weight.iter_mut().zip(v.d_weight.iter_mut()))
            {
                *mw = b1 * *mw + (1.0 - b1) * gw;
                *vw = b2 * *vw + (1.0 - b2) * gw * gw;
                *w -= lr * (*mw / bc1) / ((*vw / bc2).sqrt() + eps);
            }
            for ((b, gb), (mb, vb)) in lin
                .bias
                .iter_mut()
                .zip(g.d_bias.iter())
                .zip(m.d_bias.iter_mut().zip(v.d_bias.iter_mut()))
            {
                *mb = b1 * *mb + (1.0 - b1) * gb;
                *vb = b2 * *vb + (1.0 - b2) * gb * gb;
                *b -= lr * (*mb / bc1) / ((*vb / bc2).sqrt() + eps);
            }
        }
        Ok(())
    }
}
