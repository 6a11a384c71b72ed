//! Core types for δ-TRAIN certified robust training.
//!
//! This crate provides the foundational abstractions shared by the bound
//! propagation engine and the training orchestrator: the error type and the
//! perturbation specification describing the admissible input region.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Error types for δ-TRAIN operations.
#[derive(Debug)]
pub enum DeltaError {
    /// Configuration rejected before training starts.
    InvalidConfig(String),

    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// NaN or infinity surfaced in a loss or a propagated bound.
    NumericalInstability(String),

    /// Checkpoint persistence failed.
    Checkpoint(String),
}

impl std::fmt::Display for DeltaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeltaError::InvalidConfig(s) => write!(f, "Invalid configuration: {}", s),
            DeltaError::ShapeMismatch { expected, got } => {
                write!(f, "Shape mismatch: expected {:?}, got {:?}", expected, got)
            }
            DeltaError::NumericalInstability(s) => write!(f, "Numerical instability: {}", s),
            DeltaError::Checkpoint(s) => write!(f, "Checkpoint failure: {}", s),
        }
    }
}

impl std::error::Error for DeltaError {}

pub type Result<T> = std::result::Result<T, DeltaError>;

/// Norm of the admissible perturbation set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Norm {
    /// ℓ∞: every input coordinate may move independently by up to eps.
    Linf,
}

/// An ℓ∞ perturbation region around a batch of inputs.
///
/// The radius is specified per input channel in raw data units; the
/// elementwise bounds are pre-clipped to the valid data range, so
/// `x_l <= input <= x_u` holds everywhere by construction.
#[derive(Debug, Clone)]
pub struct PerturbationSpec {
    pub norm: Norm,
    /// Per-channel radius, length = number of input channels.
    pub eps: Array1<f32>,
    /// Elementwise lower input bounds, shape `[batch, features]`.
    pub x_l: Array2<f32>,
    /// Elementwise upper input bounds, shape `[batch, features]`.
    pub x_u: Array2<f32>,
}

impl PerturbationSpec {
    /// Build the spec for `input ± eps`, clipped to `[data_min, data_max]`.
    ///
    /// Features are channel-major: feature `i` belongs to channel
    /// `i / (features / channels)`. The radius vector length must divide the
    /// feature count.
    pub fn linf(
        input: &Array2<f32>,
        eps: &Array1<f32>,
        data_min: &Array1<f32>,
        data_max: &Array1<f32>,
    ) -> Result<Self> {
        let features = input.ncols();
        let channels = eps.len();
        if channels == 0 || features % channels != 0 {
            return Err(DeltaError::InvalidConfig(format!(
                "radius vector has {} channels but input has {} features",
                channels, features
            )));
        }
        if eps.iter().any(|&e| e < 0.0) {
            return Err(DeltaError::InvalidConfig(
                "perturbation radius must be non-negative".into(),
            ));
        }
        if data_min.len() != channels || data_max.len() != channels {
            return Err(DeltaError::ShapeMismatch {
                expected: vec![channels],
                got: vec![data_min.len(), data_max.len()],
            });
        }

        let per_channel = features / channels;
        let mut x_l = input.clone();
        let mut x_u = input.clone();
        for ((mut l_row, mut u_row), x_row) in x_l
            .rows_mut()
            .into_iter()
            .zip(x_u.rows_mut())
            .zip(input.rows())
        {
            for j in 0..features {
                let c = j / per_channel;
                let e = eps[c];
                l_row[j] = (x_row[j] - e).clamp(data_min[c], data_max[c]);
                u_row[j] = (x_row[j] + e).clamp(data_min[c], data_max[c]);
            }
        }

        Ok(Self {
            norm: Norm::Linf,
            eps: eps.clone(),
            x_l,
            x_u,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.x_l.nrows()
    }

    pub fn features(&self) -> usize {
        self.x_l.ncols()
    }

    /// Largest per-channel radius; zero iff the region is a point.
    pub fn max_radius(&self) -> f32 {
        self.eps.iter().copied().fold(0.0, f32::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_linf_spec_clips_to_data_range() {
        let input = arr2(&[[0.05, 0.95], [0.5, 0.5]]);
        let eps = arr1(&[0.1]);
        let spec = PerturbationSpec::linf(&input, &eps, &arr1(&[0.0]), &arr1(&[1.0])).unwrap();

        assert_eq!(spec.x_l[[0, 0]], 0.0); // 0.05 - 0.1 clipped
        assert!((spec.x_u[[0, 0]] - 0.15).abs() < 1e-6);
        assert_eq!(spec.x_u[[0, 1]], 1.0); // 0.95 + 0.1 clipped
        assert!((spec.x_l[[1, 0]] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_linf_spec_contains_input() {
        let input = arr2(&[[0.2, 0.8, 0.1, 0.6]]);
        let eps = arr1(&[0.05, 0.2]);
        let spec =
            PerturbationSpec::linf(&input, &eps, &arr1(&[0.0, 0.0]), &arr1(&[1.0, 1.0])).unwrap();
        for (i, &x) in input.iter().enumerate() {
            assert!(spec.x_l[[0, i]] <= x && x <= spec.x_u[[0, i]]);
        }
    }

    #[test]
    fn test_linf_spec_rejects_channel_mismatch() {
        let input = arr2(&[[0.0, 0.0, 0.0]]);
        let eps = arr1(&[0.1, 0.1]); // 2 channels, 3 features
        let err = PerturbationSpec::linf(&input, &eps, &arr1(&[0.0; 2]), &arr1(&[1.0; 2]));
        assert!(matches!(err, Err(DeltaError::InvalidConfig(_))));
    }

    #[test]
    fn test_linf_spec_rejects_negative_radius() {
        let input = arr2(&[[0.0]]);
        let eps = arr1(&[-0.1]);
        let err = PerturbationSpec::linf(&input, &eps, &arr1(&[0.0]), &arr1(&[1.0]));
        assert!(matches!(err, Err(DeltaError::InvalidConfig(_))));
    }

    #[test]
    fn test_error_display() {
        let err = DeltaError::NumericalInstability("NaN in robust loss".into());
        let msg = format!("{}", err);
        assert!(msg.contains("Numerical instability"));
        assert!(msg.contains("NaN"));
    }

    #[test]
    fn test_max_radius() {
        let input = arr2(&[[0.5, 0.5]]);
        let eps = arr1(&[0.1, 0.3]);
        let spec =
            PerturbationSpec::linf(&input, &eps, &arr1(&[0.0, 0.0]), &arr1(&[1.0, 1.0])).unwrap();
        assert_eq!(spec.max_radius(), 0.3);
    }
}
