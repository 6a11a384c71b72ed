//! Batched matrix kernels shared by the forward and bound passes.
//!
//! Internal parallelism lives here and nowhere else: the training loop and
//! the scheduler are single-threaded by contract, but the matrix products
//! they drive may fan out across cores.

use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayView2, Axis};

/// Row count above which a product is worth parallelising.
const PAR_ROWS: usize = 64;

/// `C = A · Bᵀ` for `A: [m, k]`, `B: [n, k]`.
///
/// Both operands are taken in row-major layout; the transposed-B form is the
/// one every caller needs (`x · Wᵀ`, `g · (Wᵀ)ᵀ`, `gᵀ · x`), so only it is
/// provided.
pub fn matmul_nt(a: ArrayView2<f32>, b: ArrayView2<f32>) -> Array2<f32> {
    let (m, k) = a.dim();
    let (n, k2) = b.dim();
    debug_assert_eq!(k, k2, "inner dimensions differ: {} vs {}", k, k2);

    let mut out = Array2::<f32>::zeros((m, n));
    if m >= PAR_ROWS {
        out.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(i, mut row)| {
                let ai = a.row(i);
                for (j, v) in row.iter_mut().enumerate() {
                    *v = ai.dot(&b.row(j));
                }
            });
    } else {
        for i in 0..m {
            let ai = a.row(i);
            for j in 0..n {
                out[[i, j]] = ai.dot(&b.row(j));
            }
        }
    }
    out
}
