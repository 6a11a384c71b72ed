//! CROWN-IBP margin bounds: backward linear relaxation through the network
//! using interval pre-activation bounds for the ReLU relaxations.
//!
//! The margin difference is folded into the initial coefficient matrix, so
//! the substitution directly lower-bounds `z_y - z_c`. Relaxation slopes and
//! intercepts are functions of the (IBP) intermediate bounds; during
//! differentiation they are treated as locally constant and gradients flow
//! through the linear form only.

use crate::bounds::BoundedBatch;
use crate::layers::Layer;
use crate::network::{Gradients, IbpTrace, Network};
use delta_core::{DeltaError, Result};
use ndarray::{Array1, Array2};

/// One step of the backward substitution, with enough cached state to
/// differentiate it.
#[derive(Debug, Clone)]
enum Step {
    /// `A_after = A_before · W`, `t += A_before · b`.
    Linear {
        layer: usize,
        a_before: Array2<f32>,
    },
    /// `A_after = A_before ⊙ slope`, `t += Σ_j (A_before ⊙ neg_mask)·intercept`.
    Relu {
        slope: Array2<f32>,
        intercept: Array1<f32>,
        neg_mask: Array2<f32>,
    },
}

#[derive(Debug, Clone)]
struct ExampleTrace {
    steps: Vec<Step>,
    a_final: Array2<f32>,
    center: Array1<f32>,
    radius: Array1<f32>,
}

/// CROWN-IBP margin bounds plus the cached substitution for the backward
/// pass.
#[derive(Debug, Clone)]
pub struct CrownTrace {
    examples: Vec<ExampleTrace>,
    /// `margins[[i, c]]` lower-bounds `z_y - z_c`; true-class entries are 0.
    pub margins: Array2<f32>,
}

/// Run the backward substitution for every example in the batch.
///
/// `prefix` must be an IBP trace of layers `0..len-1` over the input region:
/// it supplies both the pre-activation intervals for the ReLU relaxations
/// and the input center/radius for the final concretisation.
pub fn crown_ibp_margin_trace(
    network: &Network,
    prefix: &IbpTrace,
    labels: &[usize],
) -> Result<CrownTrace> {
    let n = network.layers.len();
    if !matches!(network.layers.last(), Some(Layer::Linear(_))) {
        return Err(DeltaError::InvalidConfig(
            "margin bounds require a linear output layer".into(),
        ));
    }
    let n_classes = network.out_features()?;
    let input = prefix
        .bounds_at(0)
        .ok_or_else(|| DeltaError::InvalidConfig("prefix trace must start at layer 0".into()))?;
    let batch = input.batch_size();
    if labels.len() != batch {
        return Err(DeltaError::ShapeMismatch {
            expected: vec![batch],
            got: vec![labels.len()],
        });
    }

    let in_center = input.center();
    let in_radius = input.radius();
    let mut margins = Array2::<f32>::zeros((batch, n_classes));
    let mut examples = Vec::with_capacity(batch);

    for i in 0..batch {
        let y = labels[i];
        if y >= n_classes {
            return Err(DeltaError::InvalidConfig(format!(
                "label {} out of range for {} classes",
                y, n_classes
            )));
        }

        // Margin coefficient matrix: row c = e_y - e_c (row y is zero).
        let mut a = Array2::<f32>::zeros((n_classes, n_classes));
        for c in 0..n_classes {
            if c != y {
                a[[c, y]] += 1.0;
                a[[c, c]] -= 1.0;
            }
        }
        let mut t = Array1::<f32>::zeros(n_classes);
        let mut steps = Vec::with_capacity(n);

        for layer_idx in (0..n).rev() {
            match &network.layers[layer_idx] {
                Layer::Linear(lin) => {
                    steps.push(Step::Linear {
                        layer: layer_idx,
                        a_before: a.clone(),
                    });
                    t += &a.dot(&lin.bias);
                    a = a.dot(&lin.weight);
                }
                Layer::ReLU(_) => {
                    let pre = prefix.bounds_at(layer_idx).ok_or_else(|| {
                        DeltaError::InvalidConfig(
                            "prefix trace does not cover a ReLU layer".into(),
                        )
                    })?;
                    let d = a.ncols();
                    let mut slope = Array2::<f32>::zeros(a.dim());
                    let mut neg_mask = Array2::<f32>::zeros(a.dim());
                    let mut intercept = Array1::<f32>::zeros(d);
                    for j in 0..d {
                        let l = pre.lower[[i, j]];
                        let u = pre.upper[[i, j]];
                        if l >= 0.0 {
                            for row in 0..a.nrows() {
                                slope[[row, j]] = 1.0;
                            }
                        } else if u <= 0.0 {
                            // slope stays 0
                        } else {
                            let width = (u - l).max(1e-12);
                            let su = u / width;
                            let bu = -su * l;
                            let sl = if u > -l { 1.0 } else { 0.0 };
                            intercept[j] = bu;
                            for row in 0..a.nrows() {
                                if a[[row, j]] >= 0.0 {
                                    slope[[row, j]] = sl;
                                } else {
                                    slope[[row, j]] = su;
                                    neg_mask[[row, j]] = 1.0;
                                    t[row] += a[[row, j]] * bu;
                                }
                            }
                        }
                    }
                    a = &a * &slope;
                    steps.push(Step::Relu {
                        slope,
                        intercept,
                        neg_mask,
                    });
                }
            }
        }

        let center = in_center.row(i).to_owned();
        let radius = in_radius.row(i).to_owned();
        for c in 0..n_classes {
            let mut lb = t[c];
            for j in 0..a.ncols() {
                lb += a[[c, j]] * center[j] - a[[c, j]].abs() * radius[j];
            }
            margins[[i, c]] = lb;
        }
        margins[[i, y]] = 0.0;

        examples.push(ExampleTrace {
            steps,
            a_final: a,
            center,
            radius,
        });
    }

    if margins.iter().any(|v| !v.is_finite()) {
        return Err(DeltaError::NumericalInstability(
            "non-finite CROWN-IBP margin bound".into(),
        ));
    }
    Ok(CrownTrace { examples, margins })
}

/// Backward through [`crown_ibp_margin_trace`]. `grad_margins` must be zero
/// at the true-class entries.
pub fn crown_ibp_margin_backward(
    network: &Network,
    trace: &CrownTrace,
    grad_margins: &Array2<f32>,
) -> Gradients {
    let mut grads = Gradients::zeros(network);

    for (i, ex) in trace.examples.iter().enumerate() {
        let g = grad_margins.row(i);
        if g.iter().all(|&v| v == 0.0) {
            continue;
        }

        // d lb_c / d A_cj = center_j - sign(A_cj)·radius_j
        let mut ga = Array2::<f32>::zeros(ex.a_final.dim());
        for c in 0..ga.nrows() {
            if g[c] == 0.0 {
                continue;
            }
            for j in 0..ga.ncols() {
                let s = if ex.a_final[[c, j]] > 0.0 {
                    1.0
                } else if ex.a_final[[c, j]] < 0.0 {
                    -1.0
                } else {
                    0.0
                };
                ga[[c, j]] = g[c] * (ex.center[j] - s * ex.radius[j]);
            }
        }

        // Walk the substitution back towards the output layer.
        for step in ex.steps.iter().rev() {
            match step {
                Step::Relu {
                    slope,
                    intercept,
                    neg_mask,
                } => {
                    let mut prev = &ga * slope;
                    for c in 0..prev.nrows() {
                        if g[c] == 0.0 {
                            continue;
                        }
                        for j in 0..prev.ncols() {
                            prev[[c, j]] += g[c] * intercept[j] * neg_mask[[c, j]];
                        }
                    }
                    ga = prev;
                }
                Step::Linear { layer, a_before } => {
                    let lin = match &network.layers[*layer] {
                        Layer::Linear(l) => l,
                        Layer::ReLU(_) => unreachable!("step recorded for a linear layer"),
                    };
                    if let Some(slot) = grads.layers[*layer].as_mut() {
                        slot.d_weight += &a_before.t().dot(&ga);
                        for c in 0..a_before.nrows() {
                            if g[c] == 0.0 {
                                continue;
                            }
                            for k in 0..a_before.ncols() {
                                slot.d_bias[k] += g[c] * a_before[[c, k]];
                            }
                        }
                    }
                    let mut prev = ga.dot(&lin.weight.t());
                    for c in 0..prev.nrows() {
                        if g[c] == 0.0 {
                            continue;
                        }
                        for k in 0..prev.ncols() {
                            prev[[c, k]] += g[c] * lin.bias[k];
                        }
                    }
                    ga = prev;
                }
            }
        }
    }
    grads
}

/// Convenience wrapper: prefix IBP trace + CROWN-IBP margins in one call.
pub fn crown_ibp_margins(
    network: &Network,
    input: &BoundedBatch,
    labels: &[usize],
) -> Result<(IbpTrace, CrownTrace)> {
    let n = network.layers.len();
    if n == 0 {
        return Err(DeltaError::InvalidConfig("empty network".into()));
    }
    let prefix = network.ibp_trace_range(input, 0..n - 1)?;
    let trace = crown_ibp_margin_trace(network, &prefix, labels)?;
    Ok((prefix, trace))
}
