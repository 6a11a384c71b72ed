//! Training data access: batched iteration plus the dataset statistics the
//! scheduler and the perturbation specification need.

use delta_core::{DeltaError, Result};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// In-memory dataset served in fixed-size batches.
///
/// Exposes per-channel `mean`/`std`/`min`/`max` and whether the inputs are
/// pre-normalised; iteration order is deterministic (shuffling happens at
/// construction, under the dataset's seed).
#[derive(Debug, Clone)]
pub struct BatchLoader {
    inputs: Array2<f32>,
    labels: Vec<usize>,
    batch_size: usize,
    pub mean: Array1<f32>,
    pub std: Array1<f32>,
    pub min: Array1<f32>,
    pub max: Array1<f32>,
    pub normalised: bool,
}

impl BatchLoader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        inputs: Array2<f32>,
        labels: Vec<usize>,
        batch_size: usize,
        mean: Array1<f32>,
        std: Array1<f32>,
        min: Array1<f32>,
        max: Array1<f32>,
        normalised: bool,
    ) -> Result<Self> {
        if inputs.nrows() != labels.len() {
            return Err(DeltaError::ShapeMismatch {
                expected: vec![inputs.nrows()],
                got: vec![labels.len()],
            });
        }
        if batch_size == 0 || inputs.nrows() == 0 {
            return Err(DeltaError::InvalidConfig(
                "dataset and batch size must be non-empty".into(),
            ));
        }
        let channels = mean.len();
        if channels == 0
            || std.len() != channels
            || min.len() != channels
            || max.len() != channels
            || inputs.ncols() % channels != 0
        {
            return Err(DeltaError::InvalidConfig(format!(
                "channel statistics ({} channels) do not match {} features",
                channels,
                inputs.ncols()
            )));
        }
        Ok(Self {
            inputs,
            labels,
            batch_size,
            mean,
            std,
            min,
            max,
            normalised,
        })
    }

    pub fn channels(&self) -> usize {
        self.mean.len()
    }

    pub fn features(&self) -> usize {
        self.inputs.ncols()
    }

    pub fn len(&self) -> usize {
        self.inputs.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.nrows() == 0
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.inputs.nrows().div_ceil(self.batch_size)
    }

    /// Iterate `(inputs, labels)` batches in order.
    pub fn iter(&self) -> impl Iterator<Item = (Array2<f32>, &[usize])> + '_ {
        (0..self.batches_per_epoch()).map(move |b| {
            let lo = b * self.batch_size;
            let hi = (lo + self.batch_size).min(self.inputs.nrows());
            let x = self.inputs.slice(ndarray::s![lo..hi, ..]).to_owned();
            (x, &self.labels[lo..hi])
        })
    }

    /// Deterministic synthetic classification data: Gaussian blobs in
    /// `[0, 1]` with one cluster pattern per class. Single-channel,
    /// unnormalised.
    pub fn synthetic(
        n: usize,
        features: usize,
        n_classes: usize,
        batch_size: usize,
        seed: u64,
    ) -> Result<Self> {
        if n_classes < 2 || features == 0 || n == 0 {
            return Err(DeltaError::InvalidConfig(
                "synthetic data needs n > 0, features > 0, classes >= 2".into(),
            ));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut inputs = Array2::<f32>::zeros((n, features));
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let class = rng.random_range(0..n_classes);
            labels.push(class);
            for j in 0..features {
                let center = if (class + j) % n_classes == 0 { 0.7 } else { 0.3 };
                let noise: f32 = rng.random_range(-0.1..0.1);
                inputs[[i, j]] = (center + noise).clamp(0.0, 1.0);
            }
        }
        Self::new(
            inputs,
            labels,
            batch_size,
            Array1::from_elem(1, 0.5),
            Array1::from_elem(1, 0.25),
            Array1::from_elem(1, 0.0),
            Array1::from_elem(1, 1.0),
            false,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn test_batches_cover_dataset() {
        let loader = BatchLoader::synthetic(17, 4, 2, 8, 1).unwrap();
        assert_eq!(loader.batches_per_epoch(), 3);
        let total: usize = loader.iter().map(|(x, y)| {
            assert_eq!(x.nrows(), y.len());
            y.len()
        }).sum();
        assert_eq!(total, 17);
    }

    #[test]
    fn test_synthetic_is_deterministic() {
        let a = BatchLoader::synthetic(10, 4, 2, 4, 42).unwrap();
        let b = BatchLoader::synthetic(10, 4, 2, 4, 42).unwrap();
        let (xa, ya) = a.iter().next().unwrap();
        let (xb, yb) = b.iter().next().unwrap();
        assert_eq!(xa, xb);
        assert_eq!(ya, yb);
    }

    #[test]
    fn test_inputs_within_declared_range() {
        let loader = BatchLoader::synthetic(50, 3, 3, 10, 7).unwrap();
        for (x, _) in loader.iter() {
            for &v in x.iter() {
                assert!((0.0..=1.0).contains(&v));
            }
        }
    }

    #[test]
    fn test_rejects_mismatched_channel_stats() {
        let inputs = Array2::<f32>::zeros((4, 3));
        let err = BatchLoader::new(
            inputs,
            vec![0, 1, 0, 1],
            2,
            arr1(&[0.5, 0.5]), // 2 channels, 3 features
            arr1(&[0.2, 0.2]),
            arr1(&[0.0, 0.0]),
            arr1(&[1.0, 1.0]),
            false,
        );
        assert!(err.is_err());
    }
}
