//! Property-based soundness tests for bound propagation.
//!
//! For any concrete input inside the input region, the network output must
//! lie inside the propagated output bounds, and every margin lower bound
//! must stay below the true margin. A small tolerance absorbs f32 rounding
//! in both the bound arithmetic and the reference evaluation.

use crate::bounds::BoundedBatch;
use crate::crown::crown_ibp_margins;
use crate::layers::{Layer, LinearLayer, ReLULayer};
use crate::network::Network;
use ndarray::{Array1, Array2};
use proptest::prelude::*;

const FP_TOLERANCE: f32 = 1e-4;

fn build_network(w1: Vec<f32>, b1: Vec<f32>, w2: Vec<f32>) -> Network {
    let mut network = Network::new();
    network.add_layer(Layer::Linear(
        LinearLayer::new(
            Array2::from_shape_vec((4, 2), w1).unwrap(),
            Some(Array1::from_vec(b1)),
        )
        .unwrap(),
    ));
    network.add_layer(Layer::ReLU(ReLULayer));
    network.add_layer(Layer::Linear(
        LinearLayer::new(Array2::from_shape_vec((3, 4), w2).unwrap(), None).unwrap(),
    ));
    network
}

fn weight_vec(len: usize) -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-2.0f32..2.0, len)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// IBP soundness: f(x) stays inside the propagated interval for grid
    /// points of the input box.
    #[test]
    fn soundness_ibp_output(
        w1 in weight_vec(8),
        b1 in weight_vec(4),
        w2 in weight_vec(12),
        x0 in -1.0f32..1.0,
        x1 in -1.0f32..1.0,
        eps in 0.01f32..0.5,
    ) {
        let network = build_network(w1, b1, w2);
        let x = Array2::from_shape_vec((1, 2), vec![x0, x1]).unwrap();
        let region = BoundedBatch::new(&x - eps, &x + eps).unwrap();
        let out = network.propagate_ibp(&region).unwrap();

        for a in 0..5 {
            for b in 0..5 {
                let mut p = x.clone();
                p[[0, 0]] += eps * (a as f32 / 2.0 - 1.0);
                p[[0, 1]] += eps * (b as f32 / 2.0 - 1.0);
                let z = network.forward(&p).unwrap();
                for j in 0..3 {
                    prop_assert!(
                        out.lower[[0, j]] - FP_TOLERANCE <= z[[0, j]]
                            && z[[0, j]] <= out.upper[[0, j]] + FP_TOLERANCE,
                        "IBP soundness violation: z[{}]={} not in [{}, {}]",
                        j, z[[0, j]], out.lower[[0, j]], out.upper[[0, j]]
                    );
                }
            }
        }
    }

    /// Margin soundness for both bound flavours: the lower bound never
    /// exceeds the true margin anywhere in the box.
    #[test]
    fn soundness_margin_bounds(
        w1 in weight_vec(8),
        b1 in weight_vec(4),
        w2 in weight_vec(12),
        x0 in -1.0f32..1.0,
        x1 in -1.0f32..1.0,
        eps in 0.01f32..0.3,
        label in 0usize..3,
    ) {
        let network = build_network(w1, b1, w2);
        let x = Array2::from_shape_vec((1, 2), vec![x0, x1]).unwrap();
        let labels = [label];
        let region = BoundedBatch::new(&x - eps, &x + eps).unwrap();

        let ibp = network.ibp_margin_trace(&region, &labels).unwrap();
        let (_, crown) = crown_ibp_margins(&network, &region, &labels).unwrap();

        for a in 0..4 {
            for b in 0..4 {
                let mut p = x.clone();
                p[[0, 0]] += eps * (2.0 * a as f32 / 3.0 - 1.0);
                p[[0, 1]] += eps * (2.0 * b as f32 / 3.0 - 1.0);
                let z = network.forward(&p).unwrap();
                for c in 0..3 {
                    if c == label {
                        continue;
                    }
                    let margin = z[[0, label]] - z[[0, c]];
                    prop_assert!(
                        ibp.margins[[0, c]] <= margin + FP_TOLERANCE,
                        "IBP margin bound {} above true margin {}",
                        ibp.margins[[0, c]], margin
                    );
                    prop_assert!(
                        crown.margins[[0, c]] <= margin + FP_TOLERANCE,
                        "CROWN-IBP margin bound {} above true margin {}",
                        crown.margins[[0, c]], margin
                    );
                }
            }
        }
    }

    /// Monotonicity in the radius: growing the box can only loosen bounds.
    #[test]
    fn soundness_bounds_widen_with_radius(
        w1 in weight_vec(8),
        b1 in weight_vec(4),
        w2 in weight_vec(12),
        eps in 0.01f32..0.3,
    ) {
        let network = build_network(w1, b1, w2);
        let x = Array2::from_shape_vec((1, 2), vec![0.3, -0.2]).unwrap();
        let small = network
            .propagate_ibp(&BoundedBatch::new(&x - eps, &x + eps).unwrap())
            .unwrap();
        let large = network
            .propagate_ibp(&BoundedBatch::new(&x - (2.0 * eps), &x + (2.0 * eps)).unwrap())
            .unwrap();
        for j in 0..3 {
            prop_assert!(large.lower[[0, j]] <= small.lower[[0, j]] + FP_TOLERANCE);
            prop_assert!(large.upper[[0, j]] >= small.upper[[0, j]] - FP_TOLERANCE);
        }
    }
}
