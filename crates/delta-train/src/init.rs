//! Weight initialisation for certified training.
//!
//! Interval widths compound multiplicatively through layers, so the usual
//! fan-in scalings leave early-training bounds orders of magnitude too
//! wide. The Gaussian below uses `sigma = sqrt(2*pi) / fan_in`, which keeps
//! the expected bound growth per layer constant.

use delta_core::{DeltaError, Result};
use delta_propagate::Network;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

/// Re-draw every affine weight from `N(0, (sqrt(2*pi)/fan_in)^2)` and zero
/// the biases. Applied on fresh runs only, never on resume.
pub fn ibp_init(network: &mut Network, seed: u64) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    for lin in network.linear_layers_mut() {
        let fan_in = lin.in_features() as f32;
        let sigma = (2.0 * std::f32::consts::PI).sqrt() / fan_in;
        let normal = Normal::new(0.0f32, sigma)
            .map_err(|e| DeltaError::InvalidConfig(format!("bad init sigma: {}", e)))?;
        lin.weight.mapv_inplace(|_| normal.sample(&mut rng));
        lin.bias.fill(0.0);
    }
    Ok(())
}
