//! Key/value gradient kernel.
//!
//! One instance owns `block_n` key rows. The key and value tiles stay resident
//! while the instance sweeps every query tile that can see them, regenerating
//! the forward probabilities as `exp(s * scale - L)` instead of reading them
//! back from memory.

use crate::kernels::tile::{matmul_nt, matmul_tn_acc, Tile};
use crate::kernels::{specialize, Element, Geometry, ProgramId, Specialization};
use crate::layout::{RowStatView, TensorView};
use crate::masks::causal::is_masked;

#[derive(Debug, Clone, Copy)]
pub struct BackwardArgs<'a, T> {
    pub q: TensorView<'a, T>,
    pub k: TensorView<'a, T>,
    pub v: TensorView<'a, T>,
    pub d_o: TensorView<'a, T>,
    pub log_norm: RowStatView<'a>,
    pub delta: RowStatView<'a>,
    pub geometry: Geometry,
}

/// Writes `dk` and `dv` (`cols x head_dim` each) for one key tile.
pub type BackwardKvFn<T> = fn(&BackwardArgs<'_, T>, ProgramId, &mut [T], &mut [T]);

pub fn select<T: Element>(spec: Specialization) -> BackwardKvFn<T> {
    specialize!(backward_kv_instance::<T>, spec, BackwardKvFn<T>)
}

pub fn backward_kv_instance<T: Element, const CAUSAL: bool, const EVEN_M: bool, const EVEN_N: bool>(
    args: &BackwardArgs<'_, T>,
    pid: ProgramId,
    dk_out: &mut [T],
    dv_out: &mut [T],
) {
    let g = &args.geometry;
    let start_n = pid.tile * g.block_n;
    let cols = if EVEN_N { g.block_n } else { g.valid_cols(start_n) };

    let q_head = args.q.head(pid.batch, pid.head);
    let do_head = args.d_o.head(pid.batch, pid.head);
    let l_head = args.log_norm.head(pid.batch, pid.head);
    let delta_head = args.delta.head(pid.batch, pid.head);

    let k = Tile::load(&args.k.head(pid.batch, pid.head), start_n, g.block_n, cols);
    let v = Tile::load(&args.v.head(pid.batch, pid.head), start_n, g.block_n, cols);

    let mut dk = Tile::zeros(g.block_n, g.head_dim);
    let mut dv = Tile::zeros(g.block_n, g.head_dim);

    let mut q = Tile::zeros(g.block_m, g.head_dim);
    let mut d_o = Tile::zeros(g.block_m, g.head_dim);
    let mut p = Tile::zeros(g.block_m, g.block_n);
    let mut dp = Tile::zeros(g.block_m, g.block_n);

    let lo = g.query_floor(pid.tile, CAUSAL);
    for start_m in (lo..g.q_len).step_by(g.block_m) {
        let rows = if EVEN_M { g.block_m } else { g.valid_rows(start_m) };
        let masked = |r: usize, c: usize| {
            (!EVEN_M && r >= rows)
                || (!EVEN_N && c >= cols)
                || (CAUSAL && is_masked(start_m + r, start_n + c, g.prefix_len))
        };

        q.reload(&q_head, start_m, rows);
        matmul_nt(&q, &k, &mut p);
        for r in 0..g.block_m {
            let lse = if r < rows { l_head.get(start_m + r) } else { 0.0 };
            for (c, value) in p.row_mut(r).iter_mut().enumerate() {
                *value = if masked(r, c) {
                    0.0
                } else {
                    (*value * g.scale - lse).exp()
                };
            }
        }

        d_o.reload(&do_head, start_m, rows);
        let mut p_low = p.clone();
        p_low.quantize::<T>();
        matmul_tn_acc(&p_low, &d_o, &mut dv);

        matmul_nt(&d_o, &v, &mut dp);
        for r in 0..g.block_m {
            let delta = if r < rows { delta_head.get(start_m + r) } else { 0.0 };
            let p_row = p.row(r);
            for (c, value) in dp.row_mut(r).iter_mut().enumerate() {
                *value = if masked(r, c) {
                    0.0
                } else {
                    p_row[c] * (*value - delta)
                };
            }
        }
        // dp now holds ds
        dp.quantize::<T>();
        matmul_tn_acc(&dp, &q, &mut dk);
    }

    dk.scale(g.scale);
    dk.store(cols, dk_out);
    dv.store(cols, dv_out);
}
