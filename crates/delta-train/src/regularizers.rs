//! Stability regularisers over intermediate certified bounds, plus the
//! weight L1 penalty.
//!
//! The ReLU-instability term penalises pre-activation intervals straddling
//! zero; the tightness term penalises interval growth relative to the input
//! width. Both exist to smooth the transition into full-radius training and
//! are applied by the composer only while the radius is still ramping.

use delta_propagate::{BoundGrad, Gradients, IbpTrace, Layer, Network};
use ndarray::Array2;

/// Weighted regulariser values and their gradient injections into the
/// originating IBP trace.
#[derive(Debug)]
pub struct RegTerms {
    pub relu: f32,
    pub tightness: f32,
    pub injections: Vec<BoundGrad>,
}

/// Compute both stability terms over every ReLU pre-activation interval in
/// `trace`, scaled by `scale` (the configured weight times any ramp decay).
pub fn shi_regularisers(network: &Network, trace: &IbpTrace, scale: f32) -> RegTerms {
    let start = trace.start();
    let end = start + trace.layers_covered();
    let relu_layers = network.relu_indices(start..end);
    if relu_layers.is_empty() || scale == 0.0 {
        return RegTerms {
            relu: 0.0,
            tightness: 0.0,
            injections: Vec::new(),
        };
    }

    let input_width = trace
        .bounds_at(start)
        .map(|b| b.mean_width())
        .unwrap_or(0.0)
        .max(1e-12);
    let k = relu_layers.len() as f32;

    let mut relu_total = 0.0;
    let mut tight_total = 0.0;
    let mut injections = Vec::with_capacity(relu_layers.len());

    for &idx in &relu_layers {
        let pre = trace
            .bounds_at(idx)
            .expect("relu index lies inside the trace");
        let (rows, cols) = pre.lower.dim();
        let n = (rows * cols) as f32;

        let mut grad_lower = Array2::<f32>::zeros((rows, cols));
        let mut grad_upper = Array2::<f32>::zeros((rows, cols));
        let mut inst = 0.0;
        for i in 0..rows {
            for j in 0..cols {
                let l = pre.lower[[i, j]];
                let u = pre.upper[[i, j]];
                let mut dl = 0.0;
                let mut du = 0.0;
                if l < 0.0 && u > 0.0 {
                    inst += u * (-l);
                    du += -l / (n * k);
                    dl += -u / (n * k);
                }
                // width/(input_width·k), per unit
                du += 1.0 / (n * input_width * k);
                dl += -1.0 / (n * input_width * k);
                grad_lower[[i, j]] = scale * dl;
                grad_upper[[i, j]] = scale * du;
            }
        }
        relu_total += inst / (n * k);
        tight_total += pre.mean_width() / (input_width * k);
        injections.push(BoundGrad {
            layer: idx,
            grad_lower,
            grad_upper,
        });
    }

    RegTerms {
        relu: scale * relu_total,
        tightness: scale * tight_total,
        injections,
    }
}

/// L1 penalty on the affine weights of the parameter store; accumulates its
/// gradient directly and returns the weighted value.
pub fn l1_regulariser(network: &Network, weight: f32, grads: &mut Gradients) -> f32 {
    let mut total = 0.0;
    for (idx, layer) in network.layers.iter().enumerate() {
        if let Layer::Linear(lin) = layer {
            total += lin.weight.mapv(f32::abs).sum();
            if let Some(slot) = grads.layers[idx].as_mut() {
                slot.d_weight
                    .zip_mut_with(&lin.weight, |g, &w| *g += weight * w.signum());
            }
        }
    }
    weight * total
}
