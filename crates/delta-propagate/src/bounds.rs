//! Elementwise interval bounds over a batch of activations.

use delta_core::{DeltaError, PerturbationSpec, Result};
use ndarray::Array2;

/// Lower/upper bounds for every activation in a batch, shape `[batch, dim]`.
#[derive(Debug, Clone)]
pub struct BoundedBatch {
    pub lower: Array2<f32>,
    pub upper: Array2<f32>,
}

impl BoundedBatch {
    pub fn new(lower: Array2<f32>, upper: Array2<f32>) -> Result<Self> {
        if lower.dim() != upper.dim() {
            return Err(DeltaError::ShapeMismatch {
                expected: lower.shape().to_vec(),
                got: upper.shape().to_vec(),
            });
        }
        if lower.iter().zip(upper.iter()).any(|(l, u)| l > u) {
            return Err(DeltaError::InvalidConfig(
                "bound lower exceeds upper".into(),
            ));
        }
        Ok(Self { lower, upper })
    }

    /// A point region: lower == upper == `x`.
    pub fn concrete(x: &Array2<f32>) -> Self {
        Self {
            lower: x.clone(),
            upper: x.clone(),
        }
    }

    pub fn from_spec(spec: &PerturbationSpec) -> Self {
        Self {
            lower: spec.x_l.clone(),
            upper: spec.x_u.clone(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.lower.nrows()
    }

    pub fn dim(&self) -> usize {
        self.lower.ncols()
    }

    /// Interval centers `(l + u) / 2`.
    pub fn center(&self) -> Array2<f32> {
        (&self.lower + &self.upper) * 0.5
    }

    /// Interval half-widths `(u - l) / 2`.
    pub fn radius(&self) -> Array2<f32> {
        (&self.upper - &self.lower) * 0.5
    }

    /// Mean interval width across the batch.
    pub fn mean_width(&self) -> f32 {
        let n = self.lower.len();
        if n == 0 {
            return 0.0;
        }
        (&self.upper - &self.lower).sum() / n as f32
    }

    /// Reject NaN or infinite bounds.
    pub fn check_finite(&self, context: &str) -> Result<()> {
        if self
            .lower
            .iter()
            .chain(self.upper.iter())
            .any(|v| !v.is_finite())
        {
            return Err(DeltaError::NumericalInstability(format!(
                "non-finite bound in {}",
                context
            )));
        }
        Ok(())
    }

    /// Does `x` lie inside the region (elementwise, inclusive)?
    pub fn contains(&self, x: &Array2<f32>) -> bool {
        x.iter()
            .zip(self.lower.iter().zip(self.upper.iter()))
            .all(|(v, (l, u))| l <= v && v <= u)
    }
}
