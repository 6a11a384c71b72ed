//! Worst-case loss composition.
//!
//! Each certified-training method is a [`CertLoss`] variant selected at
//! construction; the training loop calls [`CertLoss::compose`] once per
//! batch and never branches on the method or the radius phase itself. The
//! compose step returns the named loss terms *and* the accumulated
//! parameter gradients, since every term owns a different backward path
//! (clean pass, interval pass, linear-relaxation pass, adversarial pass).

use crate::attack::{PgdAttack, PgdPolicy};
use crate::regularizers::{l1_regulariser, shi_regularisers};
use delta_core::{DeltaError, PerturbationSpec, Result};
use delta_propagate::{
    crown_ibp_margin_backward, crown_ibp_margin_trace, BoundedBatch, ForwardTrace, Gradients,
    IbpTrace, Network,
};
use ndarray::{Array1, Array2};

// ---------------------------------------------------------------------
// Cross-entropy helpers (per-example, no reduction)
// ---------------------------------------------------------------------

pub fn log_softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.rows_mut() {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| v - max);
        let lse = row.iter().map(|v| v.exp()).sum::<f32>().ln();
        row.mapv_inplace(|v| v - lse);
    }
    out
}

/// Per-example cross-entropy, no reduction.
pub fn cross_entropy(logits: &Array2<f32>, labels: &[usize]) -> Array1<f32> {
    let ls = log_softmax(logits);
    Array1::from_iter(labels.iter().enumerate().map(|(i, &y)| -ls[[i, y]]))
}

/// Per-example gradient of the cross-entropy: `softmax(z) - onehot(y)`.
pub fn softmax_minus_onehot(logits: &Array2<f32>, labels: &[usize]) -> Array2<f32> {
    let mut p = log_softmax(logits).mapv(f32::exp);
    for (i, &y) in labels.iter().enumerate() {
        p[[i, y]] -= 1.0;
    }
    p
}

pub fn misclassified_fraction(logits: &Array2<f32>, labels: &[usize]) -> f32 {
    if labels.is_empty() {
        return 0.0;
    }
    let mut wrong = 0usize;
    for (i, &y) in labels.iter().enumerate() {
        let mut best = 0;
        let mut best_v = f32::NEG_INFINITY;
        for (j, &v) in logits.row(i).iter().enumerate() {
            if v > best_v {
                best_v = v;
                best = j;
            }
        }
        if best != y {
            wrong += 1;
        }
    }
    wrong as f32 / labels.len() as f32
}

/// Fraction of examples whose certification fails: some rival margin lower
/// bound is non-positive.
pub fn certified_error(margins: &Array2<f32>, labels: &[usize]) -> f32 {
    if labels.is_empty() {
        return 0.0;
    }
    let mut uncertified = 0usize;
    for (i, &y) in labels.iter().enumerate() {
        let fail = margins
            .row(i)
            .iter()
            .enumerate()
            .any(|(c, &m)| c != y && m <= 0.0);
        if fail {
            uncertified += 1;
        }
    }
    uncertified as f32 / labels.len() as f32
}

/// Worst-case logit vector from margin lower bounds: the true class gets 0,
/// every rival gets `-margin` (its best case against the true class).
pub fn worst_case_logits(margins: &Array2<f32>, labels: &[usize]) -> Array2<f32> {
    let mut wc = margins.mapv(|m| -m);
    for (i, &y) in labels.iter().enumerate() {
        wc[[i, y]] = 0.0;
    }
    wc
}

/// Map a gradient on the worst-case logits back onto the margins.
fn margin_grad(wc_grad: &Array2<f32>, labels: &[usize]) -> Array2<f32> {
    let mut gm = wc_grad.mapv(|g| -g);
    for (i, &y) in labels.iter().enumerate() {
        gm[[i, y]] = 0.0;
    }
    gm
}

// ---------------------------------------------------------------------
// Composition strategy
// ---------------------------------------------------------------------

/// Where the scheduled radius sits relative to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadiusPhase {
    Zero,
    Ramp,
    Stable,
}

/// Named scalar contributions of one composed batch loss.
#[derive(Debug, Clone, Default)]
pub struct LossTerms {
    pub clean: f32,
    pub certified: Option<f32>,
    pub adversarial: Option<f32>,
    pub relu_reg: Option<f32>,
    pub tightness_reg: Option<f32>,
    pub l1: Option<f32>,
    pub total: f32,
}

/// Regulariser configuration shared by all methods.
#[derive(Debug, Clone)]
pub struct RegSettings {
    /// Weight of the stability regularisers.
    pub weight: f32,
    /// Decay the stability weight as the radius approaches its target.
    pub decay: bool,
    /// Optional L1 weight penalty, applied in every phase.
    pub l1_weight: Option<f32>,
}

impl Default for RegSettings {
    fn default() -> Self {
        Self {
            weight: 0.5,
            decay: true,
            l1_weight: Some(1e-5),
        }
    }
}

/// Method-specific worst-case loss composition, fixed at construction.
#[derive(Debug, Clone)]
pub enum CertLoss {
    /// `kappa·clean + (1-kappa)·IBP` with stability regularisers during the
    /// ramp.
    IbpShi,
    /// `kappa·clean + (1-kappa)·(beta·CROWN-IBP + (1-beta)·IBP)`.
    CrownIbp,
    /// `alpha·adversarial + (1-alpha)·IBP`, adversarial radius optionally
    /// rescaled.
    MtlIbp {
        alpha: f32,
        pgd: PgdPolicy,
        pgd_eps_factor: f32,
    },
    /// Tightened-box relaxation during the ramp, split-network gradient
    /// expansion once the radius is stable.
    Staps {
        subselection_ratio: f32,
        split_at: usize,
        expansion_alpha: f32,
        gradient_link_thresh: f32,
        gradient_link_tolerance: f32,
        sabr_pgd: PgdPolicy,
        taps_pgd: PgdPolicy,
    },
}

/// Everything a composition step needs from the loop and the scheduler.
pub struct ComposeCtx<'a> {
    pub network: &'a Network,
    pub input: &'a Array2<f32>,
    pub labels: &'a [usize],
    pub spec: &'a PerturbationSpec,
    /// Per-channel radius in model input units (same units as `spec`).
    pub eps: &'a Array1<f32>,
    pub data_min: &'a Array1<f32>,
    pub data_max: &'a Array1<f32>,
    pub phase: RadiusPhase,
    pub kappa: f32,
    pub beta: f32,
    /// Raw `current / target` radius ratio, for regulariser decay.
    pub eps_ratio: f32,
    pub reg: &'a RegSettings,
    /// Per-batch seed for the adversarial search.
    pub seed: u64,
}

/// Result of composing one batch.
#[derive(Debug)]
pub struct Composed {
    pub terms: LossTerms,
    pub grads: Gradients,
    pub nat_err: f32,
    pub rob_err: Option<f32>,
    pub adv_err: Option<f32>,
}

impl CertLoss {
    /// Configuration checks that must fail before training starts.
    pub fn validate(&self, network: &Network) -> Result<()> {
        match self {
            CertLoss::IbpShi | CertLoss::CrownIbp => Ok(()),
            CertLoss::MtlIbp {
                alpha,
                pgd_eps_factor,
                ..
            } => {
                if !(0.0..=1.0).contains(alpha) {
                    return Err(DeltaError::InvalidConfig(format!(
                        "MTL alpha {} outside [0, 1]",
                        alpha
                    )));
                }
                if *pgd_eps_factor <= 0.0 {
                    return Err(DeltaError::InvalidConfig(
                        "adversarial radius factor must be positive".into(),
                    ));
                }
                Ok(())
            }
            CertLoss::Staps {
                subselection_ratio,
                split_at,
                ..
            } => {
                if !(0.0 < *subselection_ratio && *subselection_ratio <= 1.0) {
                    return Err(DeltaError::InvalidConfig(format!(
                        "subselection ratio {} outside (0, 1]",
                        subselection_ratio
                    )));
                }
                network.validate_split(*split_at)
            }
        }
    }

    /// Compose the scalar training loss and its gradients for one batch.
    pub fn compose(&self, ctx: &ComposeCtx<'_>) -> Result<Composed> {
        let net = ctx.network;
        let batch = ctx.input.nrows() as f32;
        let clean_trace = net.forward_trace(ctx.input)?;
        let clean = cross_entropy(&clean_trace.output, ctx.labels)
            .mean()
            .unwrap_or(0.0);
        let nat_err = misclassified_fraction(&clean_trace.output, ctx.labels);

        let mut terms = LossTerms {
            clean,
            ..LossTerms::default()
        };
        let mut grads = Gradients::zeros(net);
        let mut rob_err = None;
        let mut adv_err = None;

        if ctx.phase == RadiusPhase::Zero {
            // Warm-up: pure clean loss, no bound or adversarial work.
            let g = softmax_minus_onehot(&clean_trace.output, ctx.labels) / batch;
            let (gw, _) = net.backward(&clean_trace, &g);
            grads.add_assign(&gw);
            terms.total = clean;
        } else {
            match self {
                CertLoss::IbpShi => self.compose_ibp(
                    ctx,
                    &clean_trace,
                    &mut terms,
                    &mut grads,
                    &mut rob_err,
                )?,
                CertLoss::CrownIbp => self.compose_crown_ibp(
                    ctx,
                    &clean_trace,
                    &mut terms,
                    &mut grads,
                    &mut rob_err,
                )?,
                CertLoss::MtlIbp {
                    alpha,
                    pgd,
                    pgd_eps_factor,
                } => self.compose_mtl(
                    ctx,
                    *alpha,
                    pgd,
                    *pgd_eps_factor,
                    &mut terms,
                    &mut grads,
                    &mut rob_err,
                    &mut adv_err,
                )?,
                CertLoss::Staps {
                    subselection_ratio,
                    split_at,
                    expansion_alpha,
                    gradient_link_thresh,
                    gradient_link_tolerance,
                    sabr_pgd,
                    taps_pgd,
                } => {
                    if ctx.phase == RadiusPhase::Ramp {
                        self.compose_sabr(
                            ctx,
                            *subselection_ratio,
                            sabr_pgd,
                            &mut terms,
                            &mut grads,
                            &mut rob_err,
                            &mut adv_err,
                        )?;
                    } else {
                        self.compose_taps(
                            ctx,
                            *subselection_ratio,
                            *split_at,
                            *expansion_alpha,
                            *gradient_link_thresh,
                            *gradient_link_tolerance,
                            sabr_pgd,
                            taps_pgd,
                            &mut terms,
                            &mut grads,
                            &mut rob_err,
                        )?;
                    }
                }
            }
        }

        if let Some(w) = ctx.reg.l1_weight {
            let v = l1_regulariser(net, w, &mut grads);
            terms.l1 = Some(v);
            terms.total += v;
        }

        if !terms.total.is_finite() {
            return Err(DeltaError::NumericalInstability(
                "composed loss is not finite".into(),
            ));
        }
        grads.check_finite("composed loss gradients")?;

        Ok(Composed {
            terms,
            grads,
            nat_err,
            rob_err,
            adv_err,
        })
    }

    fn reg_scale(&self, ctx: &ComposeCtx<'_>) -> f32 {
        let decay = if ctx.reg.decay {
            (1.0 - ctx.eps_ratio).max(0.0)
        } else {
            1.0
        };
        ctx.reg.weight * decay
    }

    fn add_clean_grad(
        net: &Network,
        clean_trace: &ForwardTrace,
        labels: &[usize],
        scale: f32,
        grads: &mut Gradients,
    ) {
        if scale == 0.0 {
            return;
        }
        let batch = labels.len() as f32;
        let g = softmax_minus_onehot(&clean_trace.output, labels) * (scale / batch);
        let (gw, _) = net.backward(clean_trace, &g);
        grads.add_assign(&gw);
    }

    #[allow(clippy::too_many_arguments)]
    fn compose_ibp(
        &self,
        ctx: &ComposeCtx<'_>,
        clean_trace: &ForwardTrace,
        terms: &mut LossTerms,
        grads: &mut Gradients,
        rob_err: &mut Option<f32>,
    ) -> Result<()> {
        let net = ctx.network;
        let batch = ctx.labels.len() as f32;
        let region = BoundedBatch::from_spec(ctx.spec);
        let mt = net.ibp_margin_trace(&region, ctx.labels)?;

        let wc = worst_case_logits(&mt.margins, ctx.labels);
        let robust = cross_entropy(&wc, ctx.labels).mean().unwrap_or(0.0);
        *rob_err = Some(certified_error(&mt.margins, ctx.labels));

        let kappa = ctx.kappa;
        terms.certified = Some(robust);
        terms.total = kappa * terms.clean + (1.0 - kappa) * robust;

        Self::add_clean_grad(net, clean_trace, ctx.labels, kappa, grads);

        let wc_grad = softmax_minus_onehot(&wc, ctx.labels) * ((1.0 - kappa) / batch);
        let gm = margin_grad(&wc_grad, ctx.labels);
        let injections = self.ramp_regularisers(ctx, &mt.prefix, terms);
        let g = net.ibp_margin_backward(&mt, ctx.labels, &gm, &injections)?;
        grads.add_assign(&g);
        Ok(())
    }

    fn compose_crown_ibp(
        &self,
        ctx: &ComposeCtx<'_>,
        clean_trace: &ForwardTrace,
        terms: &mut LossTerms,
        grads: &mut Gradients,
        rob_err: &mut Option<f32>,
    ) -> Result<()> {
        let net = ctx.network;
        let batch = ctx.labels.len() as f32;
        let region = BoundedBatch::from_spec(ctx.spec);
        let mt = net.ibp_margin_trace(&region, ctx.labels)?;
        let ct = crown_ibp_margin_trace(net, &mt.prefix, ctx.labels)?;

        let wc_ibp = worst_case_logits(&mt.margins, ctx.labels);
        let wc_crown = worst_case_logits(&ct.margins, ctx.labels);
        let ce_ibp = cross_entropy(&wc_ibp, ctx.labels).mean().unwrap_or(0.0);
        let ce_crown = cross_entropy(&wc_crown, ctx.labels).mean().unwrap_or(0.0);

        let beta = ctx.beta;
        let kappa = ctx.kappa;
        let certified = beta * ce_crown + (1.0 - beta) * ce_ibp;
        terms.certified = Some(certified);
        terms.total = kappa * terms.clean + (1.0 - kappa) * certified;

        // Certification verdict: both margin bounds are sound, so either
        // one proving a positive margin certifies the example.
        let mut best = mt.margins.clone();
        best.zip_mut_with(&ct.margins, |b, &c| *b = b.max(c));
        *rob_err = Some(certified_error(&best, ctx.labels));

        Self::add_clean_grad(net, clean_trace, ctx.labels, kappa, grads);

        let ibp_scale = (1.0 - kappa) * (1.0 - beta) / batch;
        let gm_ibp = margin_grad(
            &(softmax_minus_onehot(&wc_ibp, ctx.labels) * ibp_scale),
            ctx.labels,
        );
        let injections = self.ramp_regularisers(ctx, &mt.prefix, terms);
        let g = net.ibp_margin_backward(&mt, ctx.labels, &gm_ibp, &injections)?;
        grads.add_assign(&g);

        let crown_scale = (1.0 - kappa) * beta / batch;
        if crown_scale != 0.0 {
            let gm_crown = margin_grad(
                &(softmax_minus_onehot(&wc_crown, ctx.labels) * crown_scale),
                ctx.labels,
            );
            let g = crown_ibp_margin_backward(net, &ct, &gm_crown);
            grads.add_assign(&g);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn compose_mtl(
        &self,
        ctx: &ComposeCtx<'_>,
        alpha: f32,
        pgd: &PgdPolicy,
        pgd_eps_factor: f32,
        terms: &mut LossTerms,
        grads: &mut Gradients,
        rob_err: &mut Option<f32>,
        adv_err: &mut Option<f32>,
    ) -> Result<()> {
        let net = ctx.network;
        let batch = ctx.labels.len() as f32;
        let region = BoundedBatch::from_spec(ctx.spec);
        let mt = net.ibp_margin_trace(&region, ctx.labels)?;

        let wc = worst_case_logits(&mt.margins, ctx.labels);
        let robust = cross_entropy(&wc, ctx.labels).mean().unwrap_or(0.0);
        *rob_err = Some(certified_error(&mt.margins, ctx.labels));

        // The adversarial term may search a different (usually smaller)
        // radius than the certified term.
        let adv_region = if (pgd_eps_factor - 1.0).abs() < f32::EPSILON {
            region
        } else {
            let scaled = ctx.eps * pgd_eps_factor;
            let spec =
                PerturbationSpec::linf(ctx.input, &scaled, ctx.data_min, ctx.data_max)?;
            BoundedBatch::from_spec(&spec)
        };
        let attack = PgdAttack::new(pgd.clone(), ctx.seed);
        let outcome = attack.attack(net, ctx.input, &adv_region, ctx.labels)?;
        let adversarial = outcome.adv_loss.mean().unwrap_or(0.0);
        *adv_err = Some(outcome.adv_err);

        terms.certified = Some(robust);
        terms.adversarial = Some(adversarial);
        terms.total = alpha * adversarial + (1.0 - alpha) * robust;

        if alpha != 0.0 {
            let adv_trace = net.forward_trace(&outcome.adv_inputs)?;
            let g = softmax_minus_onehot(&adv_trace.output, ctx.labels) * (alpha / batch);
            let (gw, _) = net.backward(&adv_trace, &g);
            grads.add_assign(&gw);
        }

        let wc_grad = softmax_minus_onehot(&wc, ctx.labels) * ((1.0 - alpha) / batch);
        let gm = margin_grad(&wc_grad, ctx.labels);
        let injections = self.ramp_regularisers(ctx, &mt.prefix, terms);
        let g = net.ibp_margin_backward(&mt, ctx.labels, &gm, &injections)?;
        grads.add_assign(&g);
        Ok(())
    }

    /// Shrink the perturbation box around an adversarially-selected center:
    /// the returned region has half-width `tau = ratio·eps` and stays inside
    /// the full box.
    fn sabr_subbox(
        &self,
        ctx: &ComposeCtx<'_>,
        ratio: f32,
        pgd: &PgdPolicy,
    ) -> Result<(BoundedBatch, f32)> {
        let net = ctx.network;
        let (rows, cols) = ctx.input.dim();
        let per_channel = cols / ctx.eps.len();
        let mut tau = Array2::<f32>::zeros((rows, cols));
        for i in 0..rows {
            for j in 0..cols {
                tau[[i, j]] = ratio * ctx.eps[j / per_channel];
            }
        }

        // Search region for the center: the full box shrunk by tau, so the
        // tau-box around any candidate center stays inside the full box.
        let center = (&ctx.spec.x_l + &ctx.spec.x_u) * 0.5;
        let mut l_s = &ctx.spec.x_l + &tau;
        l_s.zip_mut_with(&center, |v, &c| *v = v.min(c));
        let mut u_s = &ctx.spec.x_u - &tau;
        u_s.zip_mut_with(&center, |v, &c| *v = v.max(c));
        let search = BoundedBatch::new(l_s, u_s)?;

        let attack = PgdAttack::new(pgd.clone(), ctx.seed);
        let outcome = attack.attack(net, ctx.input, &search, ctx.labels)?;

        let mut l_b = &outcome.adv_inputs - &tau;
        l_b.zip_mut_with(&ctx.spec.x_l, |v, &l| *v = v.max(l));
        let mut u_b = &outcome.adv_inputs + &tau;
        u_b.zip_mut_with(&ctx.spec.x_u, |v, &u| *v = v.min(u));
        Ok((BoundedBatch::new(l_b, u_b)?, outcome.adv_err))
    }

    #[allow(clippy::too_many_arguments)]
    fn compose_sabr(
        &self,
        ctx: &ComposeCtx<'_>,
        ratio: f32,
        pgd: &PgdPolicy,
        terms: &mut LossTerms,
        grads: &mut Gradients,
        rob_err: &mut Option<f32>,
        adv_err: &mut Option<f32>,
    ) -> Result<()> {
        let net = ctx.network;
        let batch = ctx.labels.len() as f32;
        let (sub_box, pgd_err) = self.sabr_subbox(ctx, ratio, pgd)?;
        *adv_err = Some(pgd_err);

        let mt = net.ibp_margin_trace(&sub_box, ctx.labels)?;
        let wc = worst_case_logits(&mt.margins, ctx.labels);
        let robust = cross_entropy(&wc, ctx.labels).mean().unwrap_or(0.0);
        *rob_err = Some(certified_error(&mt.margins, ctx.labels));

        terms.certified = Some(robust);
        terms.total = robust;

        let wc_grad = softmax_minus_onehot(&wc, ctx.labels) / batch;
        let gm = margin_grad(&wc_grad, ctx.labels);
        let g = net.ibp_margin_backward(&mt, ctx.labels, &gm, &[])?;
        grads.add_assign(&g);

        // Stability regularisers are evaluated on the *full* perturbation
        // box, not the tightened one.
        let scale = self.reg_scale(ctx);
        if scale > 0.0 {
            let n = net.len();
            let full = net.ibp_trace_range(&BoundedBatch::from_spec(ctx.spec), 0..n - 1)?;
            let injections = self.record_regularisers(ctx, &full, terms, scale);
            if !injections.is_empty() {
                let zero = Array2::zeros(full.output().lower.dim());
                let g = net.ibp_backward(&full, &zero, &zero, &injections);
                grads.add_assign(&g);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn compose_taps(
        &self,
        ctx: &ComposeCtx<'_>,
        ratio: f32,
        split_at: usize,
        expansion_alpha: f32,
        link_thresh: f32,
        link_tolerance: f32,
        sabr_pgd: &PgdPolicy,
        taps_pgd: &PgdPolicy,
        terms: &mut LossTerms,
        grads: &mut Gradients,
        rob_err: &mut Option<f32>,
    ) -> Result<()> {
        let net = ctx.network;
        let n = net.len();
        let batch = ctx.labels.len() as f32;

        // Certify the feature block over the tightened box, then push an
        // adversarially-found worst case through the classifier block.
        let (sub_box, _) = self.sabr_subbox(ctx, ratio, sabr_pgd)?;
        let prefix = net.ibp_trace_range(&sub_box, 0..split_at)?;
        let latent = prefix.output().clone();

        let z0 = latent.center();
        let attack = PgdAttack::new(taps_pgd.clone(), ctx.seed.wrapping_add(1));
        let outcome = attack.attack_range(net, split_at..n, &z0, &latent, ctx.labels)?;

        let robust = outcome.adv_loss.mean().unwrap_or(0.0);
        *rob_err = Some(misclassified_fraction(&outcome.adv_logits, ctx.labels));
        terms.certified = Some(robust);
        terms.total = robust;

        // Classifier block: ordinary backward at the worst-case latent.
        let tail = net.forward_trace_range(&outcome.adv_inputs, split_at..n)?;
        let g_logits = softmax_minus_onehot(&tail.output, ctx.labels) / batch;
        let (g_tail, g_latent) = net.backward(&tail, &g_logits);
        grads.add_assign(&g_tail);

        // Feature block: link the latent gradient onto the bounds that
        // produced the box, magnified by the expansion factor, with a
        // smooth blend between the lower/upper faces near the threshold.
        let (gl, gu) = gradient_link(
            &outcome.adv_inputs,
            &latent,
            &g_latent,
            expansion_alpha,
            link_thresh,
            link_tolerance,
        );
        let g_prefix = net.ibp_backward(&prefix, &gl, &gu, &[]);
        grads.add_assign(&g_prefix);
        Ok(())
    }

    /// Ramp-only stability regularisers on a prefix trace; returns the
    /// gradient injections for the margin backward pass.
    fn ramp_regularisers(
        &self,
        ctx: &ComposeCtx<'_>,
        prefix: &IbpTrace,
        terms: &mut LossTerms,
    ) -> Vec<delta_propagate::BoundGrad> {
        if ctx.phase != RadiusPhase::Ramp {
            return Vec::new();
        }
        let scale = self.reg_scale(ctx);
        if scale <= 0.0 {
            return Vec::new();
        }
        self.record_regularisers(ctx, prefix, terms, scale)
    }

    fn record_regularisers(
        &self,
        ctx: &ComposeCtx<'_>,
        trace: &IbpTrace,
        terms: &mut LossTerms,
        scale: f32,
    ) -> Vec<delta_propagate::BoundGrad> {
        let reg = shi_regularisers(ctx.network, trace, scale);
        terms.relu_reg = Some(reg.relu);
        terms.tightness_reg = Some(reg.tightness);
        terms.total += reg.relu + reg.tightness;
        reg.injections
    }
}

/// Route a latent gradient onto the box faces: coordinates near the lower
/// face feed the lower bound, coordinates near the upper face feed the
/// upper bound, with a smooth sigmoid blend of width `tolerance` around
/// `thresh`. Degenerate (zero-width) coordinates split evenly.
fn gradient_link(
    z: &Array2<f32>,
    region: &BoundedBatch,
    grad: &Array2<f32>,
    expansion_alpha: f32,
    thresh: f32,
    tolerance: f32,
) -> (Array2<f32>, Array2<f32>) {
    let (rows, cols) = z.dim();
    let mut gl = Array2::<f32>::zeros((rows, cols));
    let mut gu = Array2::<f32>::zeros((rows, cols));
    let tol = tolerance.max(1e-6);
    for i in 0..rows {
        for j in 0..cols {
            let l = region.lower[[i, j]];
            let u = region.upper[[i, j]];
            let g = expansion_alpha * grad[[i, j]];
            let width = u - l;
            if width <= 1e-12 {
                gl[[i, j]] = 0.5 * g;
                gu[[i, j]] = 0.5 * g;
            } else {
                let c = (z[[i, j]] - l) / width;
                let t = ((c - thresh) / tol).clamp(-30.0, 30.0);
                let s = 1.0 / (1.0 + (-t).exp());
                gl[[i, j]] = (1.0 - s) * g;
                gu[[i, j]] = s * g;
            }
        }
    }
    (gl, gu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use delta_propagate::{Layer, LinearLayer, ReLULayer};
    use ndarray::{arr1, arr2};

    fn toy_network() -> Network {
        let mut network = Network::new();
        network.add_layer(Layer::Linear(
            LinearLayer::new(
                arr2(&[[0.9, -0.4], [0.3, 0.8], [-0.5, 0.6]]),
                Some(arr1(&[0.1, -0.2, 0.05])),
            )
            .unwrap(),
        ));
        network.add_layer(Layer::ReLU(ReLULayer));
        network.add_layer(Layer::Linear(
            LinearLayer::new(
                arr2(&[[0.7, -0.3, 0.2], [-0.6, 0.5, 0.4]]),
                Some(arr1(&[0.0, 0.1])),
            )
            .unwrap(),
        ));
        network
    }

    struct Fixture {
        network: Network,
        input: Array2<f32>,
        labels: Vec<usize>,
        spec: PerturbationSpec,
        eps: Array1<f32>,
        data_min: Array1<f32>,
        data_max: Array1<f32>,
        reg: RegSettings,
    }

    fn fixture(eps: f32) -> Fixture {
        let input = arr2(&[[0.4, 0.7], [0.2, 0.1], [0.9, 0.5], [0.6, 0.3]]);
        let eps_vec = arr1(&[eps, eps]);
        let data_min = arr1(&[0.0, 0.0]);
        let data_max = arr1(&[1.0, 1.0]);
        let spec = PerturbationSpec::linf(&input, &eps_vec, &data_min, &data_max).unwrap();
        Fixture {
            network: toy_network(),
            input,
            labels: vec![0, 1, 0, 1],
            spec,
            eps: eps_vec,
            data_min,
            data_max,
            reg: RegSettings::default(),
        }
    }

    fn ctx<'a>(f: &'a Fixture, phase: RadiusPhase, kappa: f32, beta: f32) -> ComposeCtx<'a> {
        ComposeCtx {
            network: &f.network,
            input: &f.input,
            labels: &f.labels,
            spec: &f.spec,
            eps: &f.eps,
            data_min: &f.data_min,
            data_max: &f.data_max,
            phase,
            kappa,
            beta,
            eps_ratio: match phase {
                RadiusPhase::Zero => 0.0,
                RadiusPhase::Ramp => 0.5,
                RadiusPhase::Stable => 1.0,
            },
            reg: &f.reg,
            seed: 17,
        }
    }

    #[test]
    fn test_zero_radius_reduces_to_clean_cross_entropy() {
        let mut f = fixture(0.0);
        f.reg.l1_weight = None;
        let composed = CertLoss::IbpShi
            .compose(&ctx(&f, RadiusPhase::Zero, 1.0, 1.0))
            .unwrap();
        let clean = cross_entropy(&f.network.forward(&f.input).unwrap(), &f.labels)
            .mean()
            .unwrap();
        assert!((composed.terms.total - clean).abs() < 1e-6);
        assert!(composed.terms.certified.is_none());
        assert!(composed.rob_err.is_none());
        assert!(composed.grads.max_abs() > 0.0);
    }

    #[test]
    fn test_ibp_ramp_blends_clean_and_certified() {
        let f = fixture(0.05);
        let composed = CertLoss::IbpShi
            .compose(&ctx(&f, RadiusPhase::Ramp, 0.6, 1.0))
            .unwrap();
        let t = &composed.terms;
        assert!(t.certified.is_some());
        assert!(t.relu_reg.is_some());
        assert!(t.tightness_reg.is_some());
        assert!(t.total.is_finite());
        // The blend sits between the clean and certified extremes (before
        // the additive regularisers).
        let blend = 0.6 * t.clean + 0.4 * t.certified.unwrap();
        let base = t.total - t.relu_reg.unwrap() - t.tightness_reg.unwrap() - t.l1.unwrap();
        assert!((base - blend).abs() < 1e-5);
        assert!(composed.rob_err.is_some());
    }

    #[test]
    fn test_ibp_stable_drops_stability_regularisers() {
        let f = fixture(0.05);
        let composed = CertLoss::IbpShi
            .compose(&ctx(&f, RadiusPhase::Stable, 0.0, 0.0))
            .unwrap();
        assert!(composed.terms.relu_reg.is_none());
        assert!(composed.terms.tightness_reg.is_none());
        assert!(composed.terms.certified.is_some());
    }

    #[test]
    fn test_crown_ibp_composes_finite_loss() {
        let f = fixture(0.05);
        let composed = CertLoss::CrownIbp
            .compose(&ctx(&f, RadiusPhase::Ramp, 0.5, 0.5))
            .unwrap();
        assert!(composed.terms.total.is_finite());
        assert!(composed.terms.certified.is_some());
        assert!(composed.grads.max_abs() > 0.0);
    }

    #[test]
    fn test_mtl_blends_adversarial_and_certified() {
        let f = fixture(0.05);
        let strategy = CertLoss::MtlIbp {
            alpha: 0.5,
            pgd: PgdPolicy {
                restarts: 1,
                n_steps: 3,
                ..PgdPolicy::default()
            },
            pgd_eps_factor: 1.0,
        };
        let composed = strategy
            .compose(&ctx(&f, RadiusPhase::Ramp, 0.0, 0.0))
            .unwrap();
        assert!(composed.terms.adversarial.is_some());
        assert!(composed.terms.certified.is_some());
        assert!(composed.adv_err.is_some());
        assert!(composed.terms.total.is_finite());
    }

    #[test]
    fn test_staps_ramp_uses_tightened_box() {
        let f = fixture(0.05);
        let strategy = CertLoss::Staps {
            subselection_ratio: 0.4,
            split_at: 2,
            expansion_alpha: 5.0,
            gradient_link_thresh: 0.5,
            gradient_link_tolerance: 1e-5,
            sabr_pgd: PgdPolicy {
                restarts: 1,
                n_steps: 2,
                ..PgdPolicy::default()
            },
            taps_pgd: PgdPolicy::default(),
        };
        let composed = strategy
            .compose(&ctx(&f, RadiusPhase::Ramp, 0.0, 0.0))
            .unwrap();
        assert!(composed.terms.certified.is_some());
        assert!(composed.adv_err.is_some());
        assert!(composed.terms.relu_reg.is_some());
        assert!(composed.terms.total.is_finite());
    }

    #[test]
    fn test_staps_stable_switches_to_split_network() {
        let f = fixture(0.05);
        let strategy = CertLoss::Staps {
            subselection_ratio: 0.4,
            split_at: 2,
            expansion_alpha: 5.0,
            gradient_link_thresh: 0.5,
            gradient_link_tolerance: 1e-5,
            sabr_pgd: PgdPolicy {
                restarts: 1,
                n_steps: 2,
                ..PgdPolicy::default()
            },
            taps_pgd: PgdPolicy {
                restarts: 1,
                n_steps: 4,
                ..PgdPolicy::default()
            },
        };
        let composed = strategy
            .compose(&ctx(&f, RadiusPhase::Stable, 0.0, 0.0))
            .unwrap();
        // Stable phase: no stability regularisers, certified term present.
        assert!(composed.terms.relu_reg.is_none());
        assert!(composed.terms.certified.is_some());
        assert!(composed.rob_err.is_some());
        assert!(composed.grads.max_abs() > 0.0);
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let network = toy_network();
        let bad_alpha = CertLoss::MtlIbp {
            alpha: 1.5,
            pgd: PgdPolicy::default(),
            pgd_eps_factor: 1.0,
        };
        assert!(bad_alpha.validate(&network).is_err());

        let bad_split = CertLoss::Staps {
            subselection_ratio: 0.4,
            split_at: 0,
            expansion_alpha: 5.0,
            gradient_link_thresh: 0.5,
            gradient_link_tolerance: 1e-5,
            sabr_pgd: PgdPolicy::default(),
            taps_pgd: PgdPolicy::default(),
        };
        assert!(bad_split.validate(&network).is_err());
    }

    #[test]
    fn test_worst_case_logits_and_certified_error() {
        let margins = arr2(&[[0.0, 0.5], [-0.2, 0.0]]);
        let labels = [0usize, 1];
        let wc = worst_case_logits(&margins, &labels);
        assert_eq!(wc[[0, 0]], 0.0);
        assert_eq!(wc[[0, 1]], -0.5);
        assert_eq!(wc[[1, 0]], 0.2);
        // Example 0 certified (margin 0.5 > 0), example 1 not (-0.2).
        assert!((certified_error(&margins, &labels) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_gradient_link_routes_to_nearest_face() {
        let z = arr2(&[[0.05, 0.95]]);
        let region = BoundedBatch::new(arr2(&[[0.0, 0.0]]), arr2(&[[1.0, 1.0]])).unwrap();
        let grad = arr2(&[[1.0, 1.0]]);
        let (gl, gu) = gradient_link(&z, &region, &grad, 2.0, 0.5, 1e-5);
        // Near the lower face: everything (magnified) goes to the lower bound.
        assert!((gl[[0, 0]] - 2.0).abs() < 1e-3);
        assert!(gu[[0, 0]].abs() < 1e-3);
        // Near the upper face: everything goes to the upper bound.
        assert!((gu[[0, 1]] - 2.0).abs() < 1e-3);
        assert!(gl[[0, 1]].abs() < 1e-3);
    }
}
