//! Layers of the feed-forward substrate: affine maps and ReLU.
//!
//! Each layer knows three things: how to run a concrete batch forward, how
//! to push interval bounds forward, and how to pull gradients backward
//! through both of those passes.

use crate::bounds::BoundedBatch;
use crate::gemm::matmul_nt;
use delta_core::{DeltaError, Result};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

/// Fully-connected layer `y = x · Wᵀ + b`, weight shape `[out, in]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearLayer {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl LinearLayer {
    pub fn new(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Result<Self> {
        let out = weight.nrows();
        let bias = bias.unwrap_or_else(|| Array1::zeros(out));
        if bias.len() != out {
            return Err(DeltaError::ShapeMismatch {
                expected: vec![out],
                got: vec![bias.len()],
            });
        }
        Ok(Self { weight, bias })
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut y = matmul_nt(x.view(), self.weight.view());
        y += &self.bias;
        y
    }

    /// Gradients of the forward pass: returns `(dW, db, dX)` given `dY`.
    pub fn backward(
        &self,
        x: &Array2<f32>,
        grad_out: &Array2<f32>,
    ) -> (Array2<f32>, Array1<f32>, Array2<f32>) {
        // dW = dYᵀ · X, db = Σ_batch dY, dX = dY · W
        let d_weight = matmul_nt(grad_out.t(), x.t());
        let d_bias = grad_out.sum_axis(Axis(0));
        let d_input = matmul_nt(grad_out.view(), self.weight.t());
        (d_weight, d_bias, d_input)
    }

    /// Interval propagation in centered form:
    /// `c' = c·Wᵀ + b`, `r' = r·|W|ᵀ`.
    pub fn propagate_ibp(&self, input: &BoundedBatch) -> BoundedBatch {
        let center = input.center();
        let radius = input.radius();
        let abs_w = self.weight.mapv(f32::abs);
        let mut c_out = matmul_nt(center.view(), self.weight.view());
        c_out += &self.bias;
        let r_out = matmul_nt(radius.view(), abs_w.view());
        BoundedBatch {
            lower: &c_out - &r_out,
            upper: &c_out + &r_out,
        }
    }

    /// Backward through the interval propagation. Given gradients on the
    /// output bounds, returns `(dW, db, d_lower_in, d_upper_in)`.
    pub fn ibp_backward(
        &self,
        input: &BoundedBatch,
        grad_lower: &Array2<f32>,
        grad_upper: &Array2<f32>,
    ) -> (Array2<f32>, Array1<f32>, Array2<f32>, Array2<f32>) {
        let center = input.center();
        let radius = input.radius();
        let abs_w = self.weight.mapv(f32::abs);
        let sign_w = self.weight.mapv(|w| {
            if w > 0.0 {
                1.0
            } else if w < 0.0 {
                -1.0
            } else {
                0.0
            }
        });

        // l' = c' - r', u' = c' + r'
        let g_center = grad_lower + grad_upper;
        let g_radius = grad_upper - grad_lower;

        let mut d_weight = matmul_nt(g_center.t(), center.t());
        d_weight += &(&matmul_nt(g_radius.t(), radius.t()) * &sign_w);
        let d_bias = g_center.sum_axis(Axis(0));

        let gc_in = matmul_nt(g_center.view(), self.weight.t());
        let gr_in = matmul_nt(g_radius.view(), abs_w.t());
        let d_lower = (&gc_in - &gr_in) * 0.5;
        let d_upper = (&gc_in + &gr_in) * 0.5;
        (d_weight, d_bias, d_lower, d_upper)
    }
}

/// Elementwise rectifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReLULayer;

impl ReLULayer {
    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        x.mapv(|v| v.max(0.0))
    }

    pub fn backward(&self, x: &Array2<f32>, grad_out: &Array2<f32>) -> Array2<f32> {
        let mut g = grad_out.clone();
        g.zip_mut_with(x, |gv, &xv| {
            if xv <= 0.0 {
                *gv = 0.0;
            }
        });
        g
    }

    /// Intervals map monotonically: `[l, u] -> [max(l,0), max(u,0)]`.
    pub fn propagate_ibp(&self, input: &BoundedBatch) -> BoundedBatch {
        BoundedBatch {
            lower: input.lower.mapv(|v| v.max(0.0)),
            upper: input.upper.mapv(|v| v.max(0.0)),
        }
    }

    pub fn ibp_backward(
        &self,
        input: &BoundedBatch,
        grad_lower: &Array2<f32>,
        grad_upper: &Array2<f32>,
    ) -> (Array2<f32>, Array2<f32>) {
        let mut gl = grad_lower.clone();
        gl.zip_mut_with(&input.lower, |g, &l| {
            if l <= 0.0 {
                *g = 0.0;
            }
        });
        let mut gu = grad_upper.clone();
        gu.zip_mut_with(&input.upper, |g, &u| {
            if u <= 0.0 {
                *g = 0.0;
            }
        });
        (gl, gu)
    }
}

/// A layer of the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Layer {
    Linear(LinearLayer),
    ReLU(ReLULayer),
}

impl Layer {
    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        match self {
            Layer::Linear(l) => l.forward(x),
            Layer::ReLU(r) => r.forward(x),
        }
    }

    pub fn propagate_ibp(&self, input: &BoundedBatch) -> BoundedBatch {
        match self {
            Layer::Linear(l) => l.propagate_ibp(input),
            Layer::ReLU(r) => r.propagate_ibp(input),
        }
    }

    pub fn is_relu(&self) -> bool {
        matches!(self, Layer::ReLU(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_linear_forward() {
        let layer =
            LinearLayer::new(arr2(&[[1.0, 2.0], [0.5, -1.0]]), Some(arr1(&[0.1, -0.1]))).unwrap();
        let x = arr2(&[[1.0, 1.0]]);
        let y = layer.forward(&x);
        assert!((y[[0, 0]] - 3.1).abs() < 1e-6);
        assert!((y[[0, 1]] - (-0.6)).abs() < 1e-6);
    }

    #[test]
    fn test_linear_new_rejects_bad_bias() {
        let err = LinearLayer::new(arr2(&[[1.0, 2.0]]), Some(arr1(&[0.0, 0.0])));
        assert!(err.is_err());
    }

    #[test]
    fn test_linear_ibp_matches_pos_neg_split() {
        // Centered form must agree with W⁺l + W⁻u + b.
        let layer =
            LinearLayer::new(arr2(&[[1.0, -2.0], [-0.5, 3.0]]), Some(arr1(&[0.0, 1.0]))).unwrap();
        let input = BoundedBatch::new(arr2(&[[-1.0, 0.0]]), arr2(&[[1.0, 2.0]])).unwrap();
        let out = layer.propagate_ibp(&input);

        for j in 0..2 {
            let mut lo = layer.bias[j];
            let mut hi = layer.bias[j];
            for k in 0..2 {
                let w = layer.weight[[j, k]];
                if w >= 0.0 {
                    lo += w * input.lower[[0, k]];
                    hi += w * input.upper[[0, k]];
                } else {
                    lo += w * input.upper[[0, k]];
                    hi += w * input.lower[[0, k]];
                }
            }
            assert!((out.lower[[0, j]] - lo).abs() < 1e-5);
            assert!((out.upper[[0, j]] - hi).abs() < 1e-5);
        }
    }

    #[test]
    fn test_relu_ibp() {
        let input = BoundedBatch::new(arr2(&[[-2.0, -1.0, 0.5]]), arr2(&[[-1.0, 1.0, 2.0]])).unwrap();
        let out = ReLULayer.propagate_ibp(&input);
        assert_eq!(out.lower[[0, 0]], 0.0);
        assert_eq!(out.upper[[0, 0]], 0.0);
        assert_eq!(out.lower[[0, 1]], 0.0);
        assert_eq!(out.upper[[0, 1]], 1.0);
        assert_eq!(out.lower[[0, 2]], 0.5);
    }

    #[test]
    fn test_relu_backward_masks_inactive() {
        let x = arr2(&[[-1.0, 2.0]]);
        let g = arr2(&[[1.0, 1.0]]);
        let gx = ReLULayer.backward(&x, &g);
        assert_eq!(gx[[0, 0]], 0.0);
        assert_eq!(gx[[0, 1]], 1.0);
    }
}
