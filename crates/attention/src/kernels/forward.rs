//! Streaming-softmax forward kernel.
//!
//! One instance owns `block_m` query rows of one `(batch, head)` pair and
//! sweeps the key/value tiles in ascending order, keeping a running row max
//! `m`, running denominator `l` and an unnormalised accumulator. The score
//! matrix never exists beyond a `block_m x block_n` tile.

use crate::kernels::tile::{matmul_nn_acc, matmul_nt, Tile};
use crate::kernels::{specialize, Element, Geometry, ProgramId, Specialization};
use crate::layout::TensorView;
use crate::masks::causal::is_masked;

/// Read-only operands of a forward launch.
#[derive(Debug, Clone, Copy)]
pub struct ForwardArgs<'a, T> {
    pub q: TensorView<'a, T>,
    pub k: TensorView<'a, T>,
    pub v: TensorView<'a, T>,
    pub geometry: Geometry,
}

/// Entry point of one grid instance: writes `out` (`rows x head_dim`) and
/// `log_norm` (`rows`) for the rows of its query tile.
pub type ForwardFn<T> = fn(&ForwardArgs<'_, T>, ProgramId, &mut [T], &mut [f32]);

pub fn select<T: Element>(spec: Specialization) -> ForwardFn<T> {
    specialize!(forward_instance::<T>, spec, ForwardFn<T>)
}

pub fn forward_instance<T: Element, const CAUSAL: bool, const EVEN_M: bool, const EVEN_N: bool>(
    args: &ForwardArgs<'_, T>,
    pid: ProgramId,
    out: &mut [T],
    log_norm: &mut [f32],
) {
    let g = &args.geometry;
    let start_m = pid.tile * g.block_m;
    let rows = if EVEN_M { g.block_m } else { g.valid_rows(start_m) };

    let q_head = args.q.head(pid.batch, pid.head);
    let k_head = args.k.head(pid.batch, pid.head);
    let v_head = args.v.head(pid.batch, pid.head);

    let q = Tile::load(&q_head, start_m, rows, rows);
    let mut k = Tile::zeros(g.block_n, g.head_dim);
    let mut v = Tile::zeros(g.block_n, g.head_dim);
    let mut s = Tile::zeros(rows, g.block_n);

    let mut m_i = vec![f32::NEG_INFINITY; rows];
    let mut l_i = vec![0f32; rows];
    let mut acc = Tile::zeros(rows, g.head_dim);

    let hi = g.key_bound(pid.tile, CAUSAL);
    for start_n in (0..hi).step_by(g.block_n) {
        let cols = if EVEN_N { g.block_n } else { g.valid_cols(start_n) };
        k.reload(&k_head, start_n, cols);
        v.reload(&v_head, start_n, cols);

        matmul_nt(&q, &k, &mut s);

        for r in 0..rows {
            let scores = s.row_mut(r);
            for (c, score) in scores.iter_mut().enumerate() {
                let out_of_range = !EVEN_N && c >= cols;
                if out_of_range || (CAUSAL && is_masked(start_m + r, start_n + c, g.prefix_len)) {
                    *score = f32::NEG_INFINITY;
                }
            }

            let m_new = scores.iter().fold(m_i[r], |acc, &x| acc.max(x));
            let alpha = ((m_i[r] - m_new) * g.scale).exp();
            let shift = m_new * g.scale;
            let mut row_sum = 0f32;
            for score in scores.iter_mut() {
                *score = (*score * g.scale - shift).exp();
                row_sum += *score;
            }

            for value in acc.row_mut(r) {
                *value *= alpha;
            }
            l_i[r] = l_i[r] * alpha + row_sum;
            m_i[r] = m_new;
        }

        s.quantize::<T>();
        matmul_nn_acc(&s, &v, &mut acc);
    }

    for r in 0..rows {
        let inv = 1.0 / l_i[r];
        for value in acc.row_mut(r) {
            *value *= inv;
        }
        log_norm[r] = m_i[r] * g.scale + l_i[r].ln();
    }
    acc.store(rows, out);
}
