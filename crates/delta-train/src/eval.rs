//! Post-training evaluation: natural, adversarial and certified accuracy
//! over a loader at a fixed radius.

use crate::attack::{PgdAttack, PgdPolicy};
use crate::data::BatchLoader;
use crate::loss::{certified_error, misclassified_fraction};
use delta_core::{PerturbationSpec, Result};
use delta_propagate::{BoundedBatch, Network};
use ndarray::Array1;

#[derive(Debug, Clone)]
pub struct EvalReport {
    pub nat_acc: f32,
    pub adv_acc: f32,
    pub cert_acc: f32,
}

/// Evaluate all three accuracies at radius `eps` (raw data units).
pub fn evaluate(
    network: &Network,
    loader: &BatchLoader,
    eps: f32,
    pgd: &PgdPolicy,
    seed: u64,
) -> Result<EvalReport> {
    let batches = loader.batches_per_epoch() as f32;
    let mut eps_vec = Array1::from_elem(loader.channels(), eps);
    if loader.normalised {
        eps_vec /= &loader.std;
    }

    let mut nat_err = 0.0;
    let mut adv_err = 0.0;
    let mut cert_err = 0.0;
    for (x, labels) in loader.iter() {
        let logits = network.forward(&x)?;
        nat_err += misclassified_fraction(&logits, labels);

        let spec = PerturbationSpec::linf(&x, &eps_vec, &loader.min, &loader.max)?;
        let region = BoundedBatch::from_spec(&spec);
        let margins = network.ibp_margin_trace(&region, labels)?.margins;
        cert_err += certified_error(&margins, labels);

        let outcome = PgdAttack::new(pgd.clone(), seed).attack(network, &x, &region, labels)?;
        adv_err += outcome.adv_err;
    }

    Ok(EvalReport {
        nat_acc: 1.0 - nat_err / batches,
        adv_acc: 1.0 - adv_err / batches,
        cert_acc: 1.0 - cert_err / batches,
    })
}
