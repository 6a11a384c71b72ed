//! The feed-forward network: one owned parameter store, two views.
//!
//! The plain forward pass (what a deployed classifier computes) and the
//! bound-propagating pass (what the certification engine computes) are both
//! methods on the same [`Network`] value. There is no second "hardened"
//! object to keep in sync: any parameter update is visible to both views by
//! construction.
//!
//! Every pass has a differentiable counterpart: [`Network::backward`] for
//! the concrete pass and [`Network::ibp_backward`] for the interval pass,
//! the latter accepting gradient injections at intermediate bounds so
//! regularisers defined on pre-activation intervals can participate in the
//! same backward sweep.

use crate::bounds::BoundedBatch;
use crate::layers::{Layer, LinearLayer};
use delta_core::{DeltaError, Result};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Ordered layers; construct with [`Network::new`] + [`Network::add_layer`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Network {
    pub layers: Vec<Layer>,
}

/// Cached activations of a concrete forward pass over a layer range.
#[derive(Debug, Clone)]
pub struct ForwardTrace {
    start: usize,
    /// `inputs[i]` is the input to layer `start + i`.
    inputs: Vec<Array2<f32>>,
    pub output: Array2<f32>,
}

/// Cached interval bounds of an IBP pass over a layer range.
#[derive(Debug, Clone)]
pub struct IbpTrace {
    start: usize,
    /// `bounds[i]` is the input bounds of layer `start + i`; the last entry
    /// is the output bounds of the range.
    bounds: Vec<BoundedBatch>,
}

impl IbpTrace {
    pub fn output(&self) -> &BoundedBatch {
        self.bounds
            .last()
            .expect("trace always holds the input bounds")
    }

    /// Input bounds of the given absolute layer index.
    pub fn bounds_at(&self, layer: usize) -> Option<&BoundedBatch> {
        layer
            .checked_sub(self.start)
            .and_then(|i| self.bounds.get(i))
    }

    pub fn start(&self) -> usize {
        self.start
    }

    /// Number of layers the trace propagated through.
    pub fn layers_covered(&self) -> usize {
        self.bounds.len() - 1
    }
}

/// Parameter gradients of one linear layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerGrad {
    pub d_weight: Array2<f32>,
    pub d_bias: Array1<f32>,
}

/// Gradients aligned with the network's layer list (`None` for layers
/// without parameters).
#[derive(Debug, Clone)]
pub struct Gradients {
    pub layers: Vec<Option<LayerGrad>>,
}

impl Gradients {
    pub fn zeros(network: &Network) -> Self {
        let layers = network
            .layers
            .iter()
            .map(|layer| match layer {
                Layer::Linear(l) => Some(LayerGrad {
                    d_weight: Array2::zeros(l.weight.dim()),
                    d_bias: Array1::zeros(l.bias.len()),
                }),
                Layer::ReLU(_) => None,
            })
            .collect();
        Self { layers }
    }

    /// Elementwise accumulation; shapes must agree.
    pub fn add_assign(&mut self, other: &Gradients) {
        for (dst, src) in self.layers.iter_mut().zip(other.layers.iter()) {
            if let (Some(d), Some(s)) = (dst.as_mut(), src.as_ref()) {
                d.d_weight += &s.d_weight;
                d.d_bias += &s.d_bias;
            }
        }
    }

    /// Clamp every gradient entry into `[-clip, clip]`.
    pub fn clip_values(&mut self, clip: f32) {
        for grad in self.layers.iter_mut().flatten() {
            grad.d_weight.mapv_inplace(|g| g.clamp(-clip, clip));
            grad.d_bias.mapv_inplace(|g| g.clamp(-clip, clip));
        }
    }

    /// Largest absolute gradient entry.
    pub fn max_abs(&self) -> f32 {
        let mut m = 0.0f32;
        for grad in self.layers.iter().flatten() {
            for v in grad.d_weight.iter().chain(grad.d_bias.iter()) {
                m = m.max(v.abs());
            }
        }
        m
    }

    pub fn check_finite(&self, context: &str) -> Result<()> {
        for grad in self.layers.iter().flatten() {
            if grad
                .d_weight
                .iter()
                .chain(grad.d_bias.iter())
                .any(|v| !v.is_finite())
            {
                return Err(DeltaError::NumericalInstability(format!(
                    "non-finite gradient in {}",
                    context
                )));
            }
        }
        Ok(())
    }
}

/// A gradient contribution injected at an intermediate bound of an IBP
/// trace: `layer` is the absolute index whose *input* bounds the gradient
/// refers to.
#[derive(Debug, Clone)]
pub struct BoundGrad {
    pub layer: usize,
    pub grad_lower: Array2<f32>,
    pub grad_upper: Array2<f32>,
}

/// IBP margin bounds with the trace needed to differentiate them.
#[derive(Debug, Clone)]
pub struct MarginTrace {
    pub prefix: IbpTrace,
    /// `margins[[i, c]]` lower-bounds `z_y - z_c` for example `i`; the
    /// true-class entry is identically zero.
    pub margins: Array2<f32>,
}

impl Network {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    pub fn add_layer(&mut self, layer: Layer) {
        self.layers.push(layer);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Input width of the first affine layer.
    pub fn in_features(&self) -> Result<usize> {
        match self.layers.first() {
            Some(Layer::Linear(l)) => Ok(l.in_features()),
            _ => Err(DeltaError::InvalidConfig(
                "network must start with a linear layer".into(),
            )),
        }
    }

    /// Output width of the last affine layer (= number of classes).
    pub fn out_features(&self) -> Result<usize> {
        match self.layers.last() {
            Some(Layer::Linear(l)) => Ok(l.out_features()),
            _ => Err(DeltaError::InvalidConfig(
                "network must end with a linear layer".into(),
            )),
        }
    }

    pub fn linear_layers_mut(&mut self) -> impl Iterator<Item = &mut LinearLayer> {
        self.layers.iter_mut().filter_map(|l| match l {
            Layer::Linear(lin) => Some(lin),
            Layer::ReLU(_) => None,
        })
    }

    pub fn linear_layers(&self) -> impl Iterator<Item = &LinearLayer> {
        self.layers.iter().filter_map(|l| match l {
            Layer::Linear(lin) => Some(lin),
            Layer::ReLU(_) => None,
        })
    }

    /// Absolute indices of ReLU layers inside `range`.
    pub fn relu_indices(&self, range: Range<usize>) -> Vec<usize> {
        range.filter(|&i| self.layers[i].is_relu()).collect()
    }

    fn check_range(&self, range: &Range<usize>) -> Result<()> {
        if range.start > range.end || range.end > self.layers.len() {
            return Err(DeltaError::InvalidConfig(format!(
                "layer range {}..{} out of bounds for {} layers",
                range.start,
                range.end,
                self.layers.len()
            )));
        }
        Ok(())
    }

    /// Validate a split point for the two-block view: both the prefix and
    /// the suffix must be non-empty and the suffix must end in the
    /// classifier head.
    pub fn validate_split(&self, split_at: usize) -> Result<()> {
        if split_at == 0 || split_at >= self.layers.len() {
            return Err(DeltaError::InvalidConfig(format!(
                "split index {} must fall strictly inside 1..{}",
                split_at,
                self.layers.len()
            )));
        }
        match self.layers.last() {
            Some(Layer::Linear(_)) => Ok(()),
            _ => Err(DeltaError::InvalidConfig(
                "split network must end with a linear layer".into(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Concrete forward/backward (the "original" view)
    // ------------------------------------------------------------------

    pub fn forward(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        Ok(self.forward_trace(x)?.output)
    }

    pub fn forward_trace(&self, x: &Array2<f32>) -> Result<ForwardTrace> {
        self.forward_trace_range(x, 0..self.layers.len())
    }

    pub fn forward_trace_range(&self, x: &Array2<f32>, range: Range<usize>) -> Result<ForwardTrace> {
        self.check_range(&range)?;
        let start = range.start;
        let mut inputs = Vec::with_capacity(range.len());
        let mut cur = x.clone();
        for i in range {
            let next = self.layers[i].forward(&cur);
            inputs.push(cur);
            cur = next;
        }
        if cur.iter().any(|v| !v.is_finite()) {
            return Err(DeltaError::NumericalInstability(
                "non-finite activation in forward pass".into(),
            ));
        }
        Ok(ForwardTrace {
            start,
            inputs,
            output: cur,
        })
    }

    /// Backward through a cached forward pass. Returns parameter gradients
    /// (zero outside the trace's range) and the gradient w.r.t. the input.
    pub fn backward(&self, trace: &ForwardTrace, grad_out: &Array2<f32>) -> (Gradients, Array2<f32>) {
        let mut grads = Gradients::zeros(self);
        let mut g = grad_out.clone();
        for (i, input) in trace.inputs.iter().enumerate().rev() {
            let layer_idx = trace.start + i;
            match &self.layers[layer_idx] {
                Layer::Linear(lin) => {
                    let (dw, db, dx) = lin.backward(input, &g);
                    if let Some(slot) = grads.layers[layer_idx].as_mut() {
                        slot.d_weight += &dw;
                        slot.d_bias += &db;
                    }
                    g = dx;
                }
                Layer::ReLU(relu) => {
                    g = relu.backward(input, &g);
                }
            }
        }
        (grads, g)
    }

    // ------------------------------------------------------------------
    // Interval propagation (the "hardened" view)
    // ------------------------------------------------------------------

    pub fn propagate_ibp(&self, input: &BoundedBatch) -> Result<BoundedBatch> {
        Ok(self
            .ibp_trace_range(input, 0..self.layers.len())?
            .output()
            .clone())
    }

    pub fn ibp_trace(&self, input: &BoundedBatch) -> Result<IbpTrace> {
        self.ibp_trace_range(input, 0..self.layers.len())
    }

    pub fn ibp_trace_range(&self, input: &BoundedBatch, range: Range<usize>) -> Result<IbpTrace> {
        self.check_range(&range)?;
        let start = range.start;
        let mut bounds = Vec::with_capacity(range.len() + 1);
        let mut cur = input.clone();
        for i in range {
            let next = self.layers[i].propagate_ibp(&cur);
            bounds.push(cur);
            cur = next;
        }
        cur.check_finite("interval propagation")?;
        bounds.push(cur);
        Ok(IbpTrace { start, bounds })
    }

    /// Backward through a cached IBP pass.
    ///
    /// `grad_lower`/`grad_upper` are gradients on the trace's output bounds;
    /// `injected` adds contributions at intermediate bounds (regularisers on
    /// pre-activation intervals). Returns parameter gradients.
    pub fn ibp_backward(
        &self,
        trace: &IbpTrace,
        grad_lower: &Array2<f32>,
        grad_upper: &Array2<f32>,
        injected: &[BoundGrad],
    ) -> Gradients {
        let mut grads = Gradients::zeros(self);
        let n = trace.bounds.len() - 1;
        let mut gl = grad_lower.clone();
        let mut gu = grad_upper.clone();
        for inj in injected {
            if inj.layer == trace.start + n {
                gl += &inj.grad_lower;
                gu += &inj.grad_upper;
            }
        }
        for p in (0..n).rev() {
            let layer_idx = trace.start + p;
            let input = &trace.bounds[p];
            match &self.layers[layer_idx] {
                Layer::Linear(lin) => {
                    let (dw, db, dl, du) = lin.ibp_backward(input, &gl, &gu);
                    if let Some(slot) = grads.layers[layer_idx].as_mut() {
                        slot.d_weight += &dw;
                        slot.d_bias += &db;
                    }
                    gl = dl;
                    gu = du;
                }
                Layer::ReLU(relu) => {
                    let (dl, du) = relu.ibp_backward(input, &gl, &gu);
                    gl = dl;
                    gu = du;
                }
            }
            for inj in injected {
                if inj.layer == layer_idx {
                    gl += &inj.grad_lower;
                    gu += &inj.grad_upper;
                }
            }
        }
        grads
    }

    // ------------------------------------------------------------------
    // Margin bounds (certification objective)
    // ------------------------------------------------------------------

    /// Lower bounds on the class margins `z_y - z_c`, with the margin
    /// difference folded into the last affine layer (tighter than bounding
    /// the logits separately).
    pub fn ibp_margin_trace(
        &self,
        input: &BoundedBatch,
        labels: &[usize],
    ) -> Result<MarginTrace> {
        let n = self.layers.len();
        let last = match self.layers.last() {
            Some(Layer::Linear(l)) => l,
            _ => {
                return Err(DeltaError::InvalidConfig(
                    "margin bounds require a linear output layer".into(),
                ))
            }
        };
        if labels.len() != input.batch_size() {
            return Err(DeltaError::ShapeMismatch {
                expected: vec![input.batch_size()],
                got: vec![labels.len()],
            });
        }
        let n_classes = last.out_features();
        if let Some(&bad) = labels.iter().find(|&&y| y >= n_classes) {
            return Err(DeltaError::InvalidConfig(format!(
                "label {} out of range for {} classes",
                bad, n_classes
            )));
        }

        let prefix = self.ibp_trace_range(input, 0..n - 1)?;
        let penult = prefix.output();
        let center = penult.center();
        let radius = penult.radius();

        let batch = input.batch_size();
        let mut margins = Array2::<f32>::zeros((batch, n_classes));
        for i in 0..batch {
            let y = labels[i];
            let c_i = center.row(i);
            let r_i = radius.row(i);
            for j in 0..n_classes {
                if j == y {
                    continue;
                }
                let mut lb = last.bias[y] - last.bias[j];
                for k in 0..last.in_features() {
                    let w = last.weight[[y, k]] - last.weight[[j, k]];
                    lb += w * c_i[k] - w.abs() * r_i[k];
                }
                margins[[i, j]] = lb;
            }
        }
        if margins.iter().any(|v| !v.is_finite()) {
            return Err(DeltaError::NumericalInstability(
                "non-finite margin bound".into(),
            ));
        }
        Ok(MarginTrace { prefix, margins })
    }

    /// Backward through [`Network::ibp_margin_trace`]. `grad_margins` must
    /// be zero at the true-class entries.
    pub fn ibp_margin_backward(
        &self,
        trace: &MarginTrace,
        labels: &[usize],
        grad_margins: &Array2<f32>,
        injected: &[BoundGrad],
    ) -> Result<Gradients> {
        let n = self.layers.len();
        let last = match self.layers.last() {
            Some(Layer::Linear(l)) => l,
            _ => {
                return Err(DeltaError::InvalidConfig(
                    "margin bounds require a linear output layer".into(),
                ))
            }
        };
        let penult = trace.prefix.output();
        let center = penult.center();
        let radius = penult.radius();
        let (batch, n_classes) = grad_margins.dim();
        let h = last.in_features();

        let mut d_weight = Array2::<f32>::zeros(last.weight.dim());
        let mut d_bias = Array1::<f32>::zeros(last.bias.len());
        let mut g_center = Array2::<f32>::zeros((batch, h));
        let mut g_radius = Array2::<f32>::zeros((batch, h));

        for i in 0..batch {
            let y = labels[i];
            for j in 0..n_classes {
                if j == y {
                    continue;
                }
                let g = grad_margins[[i, j]];
                if g == 0.0 {
                    continue;
                }
                d_bias[y] += g;
                d_bias[j] -= g;
                for k in 0..h {
                    let w = last.weight[[y, k]] - last.weight[[j, k]];
                    let s = if w > 0.0 {
                        1.0
                    } else if w < 0.0 {
                        -1.0
                    } else {
                        0.0
                    };
                    let c = center[[i, k]];
                    let r = radius[[i, k]];
                    // lb = w·c - |w|·r + const
                    d_weight[[y, k]] += g * (c - s * r);
                    d_weight[[j, k]] -= g * (c - s * r);
                    g_center[[i, k]] += g * w;
                    g_radius[[i, k]] -= g * w.abs();
                }
            }
        }

        let gl = (&g_center - &g_radius) * 0.5;
        let gu = (&g_center + &g_radius) * 0.5;
        let mut grads = self.ibp_backward(&trace.prefix, &gl, &gu, injected);
        if let Some(slot) = grads.layers[n - 1].as_mut() {
            slot.d_weight += &d_weight;
            slot.d_bias += &d_bias;
        }
        Ok(grads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{LinearLayer, ReLULayer};
    use ndarray::{arr1, arr2};

    fn toy_network() -> Network {
        let mut network = Network::new();
        network.add_layer(Layer::Linear(
            LinearLayer::new(
                arr2(&[[1.0, 0.5], [-0.5, 1.0]]),
                Some(arr1(&[0.1, -0.1])),
            )
            .unwrap(),
        ));
        network.add_layer(Layer::ReLU(ReLULayer));
        network.add_layer(Layer::Linear(
            LinearLayer::new(arr2(&[[1.0, -1.0], [0.5, 0.5]]), None).unwrap(),
        ));
        network
    }

    #[test]
    fn test_forward_shapes() {
        let network = toy_network();
        let y = network.forward(&arr2(&[[0.2, -0.3], [1.0, 1.0]])).unwrap();
        assert_eq!(y.dim(), (2, 2));
    }

    #[test]
    fn test_ibp_contains_forward_output() {
        let network = toy_network();
        let x = arr2(&[[0.2, -0.3]]);
        let y = network.forward(&x).unwrap();
        let region = BoundedBatch::new(&x - 0.05, &x + 0.05).unwrap();
        let out = network.propagate_ibp(&region).unwrap();
        for j in 0..2 {
            assert!(out.lower[[0, j]] <= y[[0, j]] + 1e-5);
            assert!(out.upper[[0, j]] >= y[[0, j]] - 1e-5);
        }
    }

    #[test]
    fn test_concrete_region_ibp_equals_forward() {
        let network = toy_network();
        let x = arr2(&[[0.4, 0.9]]);
        let y = network.forward(&x).unwrap();
        let out = network.propagate_ibp(&BoundedBatch::concrete(&x)).unwrap();
        for j in 0..2 {
            assert!((out.lower[[0, j]] - y[[0, j]]).abs() < 1e-5);
            assert!((out.upper[[0, j]] - y[[0, j]]).abs() < 1e-5);
        }
    }

    #[test]
    fn test_margin_bounds_zero_radius_match_logit_differences() {
        let network = toy_network();
        let x = arr2(&[[0.7, 0.1]]);
        let labels = [0usize];
        let y = network.forward(&x).unwrap();
        let trace = network
            .ibp_margin_trace(&BoundedBatch::concrete(&x), &labels)
            .unwrap();
        let expected = y[[0, 0]] - y[[0, 1]];
        assert!((trace.margins[[0, 1]] - expected).abs() < 1e-5);
        assert_eq!(trace.margins[[0, 0]], 0.0);
    }

    #[test]
    fn test_margin_bounds_shrink_with_radius() {
        let network = toy_network();
        let x = arr2(&[[0.7, 0.1]]);
        let labels = [0usize];
        let tight = network
            .ibp_margin_trace(&BoundedBatch::new(&x - 0.01, &x + 0.01).unwrap(), &labels)
            .unwrap();
        let loose = network
            .ibp_margin_trace(&BoundedBatch::new(&x - 0.2, &x + 0.2).unwrap(), &labels)
            .unwrap();
        assert!(loose.margins[[0, 1]] <= tight.margins[[0, 1]]);
    }

    #[test]
    fn test_split_validation() {
        let network = toy_network();
        assert!(network.validate_split(0).is_err());
        assert!(network.validate_split(3).is_err());
        assert!(network.validate_split(2).is_ok());
    }

    #[test]
    fn test_range_forward_composes() {
        let network = toy_network();
        let x = arr2(&[[0.3, -0.8]]);
        let full = network.forward(&x).unwrap();
        let head = network.forward_trace_range(&x, 0..2).unwrap();
        let tail = network.forward_trace_range(&head.output, 2..3).unwrap();
        for j in 0..2 {
            assert!((tail.output[[0, j]] - full[[0, j]]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_non_finite_activations_are_fatal() {
        let mut network = Network::new();
        network.add_layer(Layer::Linear(
            LinearLayer::new(arr2(&[[f32::MAX, f32::MAX]]), None).unwrap(),
        ));
        let err = network.forward(&arr2(&[[f32::MAX, f32::MAX]]));
        assert!(matches!(err, Err(DeltaError::NumericalInstability(_))));
    }

    #[test]
    fn test_network_serde_roundtrip() {
        let network = toy_network();
        let x = arr2(&[[0.3, -0.4]]);
        let json = serde_json::to_string(&network).unwrap();
        let restored: Network = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.layers.len(), 3);
        let y = network.forward(&x).unwrap();
        let y2 = restored.forward(&x).unwrap();
        assert_eq!(y, y2);
    }

    #[test]
    fn test_gradient_clipping_bounds_entries() {
        let network = toy_network();
        let x = arr2(&[[100.0, -100.0]]);
        let trace = network.forward_trace(&x).unwrap();
        let huge = arr2(&[[1e6, -1e6]]);
        let (mut grads, _) = network.backward(&trace, &huge);
        assert!(grads.max_abs() > 10.0);
        grads.clip_values(10.0);
        assert!(grads.max_abs() <= 10.0);
    }
}
