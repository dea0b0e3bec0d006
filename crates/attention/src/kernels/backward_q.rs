//! Query gradient kernel.
//!
//! Mirror image of the key/value kernel: one instance owns `block_m` query
//! rows, keeps `Q`, `dO`, `L` and `delta` for them resident, and sweeps the
//! visible key tiles. The whole `dq` tile is accumulated inside the instance,
//! so no two instances ever touch the same rows.

use crate::core::DqBoundary;
use crate::kernels::backward_kv::BackwardArgs;
use crate::kernels::tile::{matmul_nn_acc, matmul_nt, Tile};
use crate::kernels::{specialize, Element, ProgramId, Specialization};
use crate::masks::causal::is_masked;

/// Writes the rows of `dq` (`rows x head_dim`) owned by one query tile.
pub type BackwardQFn<T> = fn(&BackwardArgs<'_, T>, DqBoundary, ProgramId, &mut [T]);

pub fn select<T: Element>(spec: Specialization) -> BackwardQFn<T> {
    specialize!(backward_q_instance::<T>, spec, BackwardQFn<T>)
}

/// Number of leading lanes a boundary mask keeps on a partial tile.
///
/// `Absolute` keeps `len - start`; `Remainder` compares the global index
/// against `len % block`, which keeps nothing past the first tile.
fn kept_lanes(boundary: DqBoundary, start: usize, block: usize, len: usize) -> usize {
    match boundary {
        DqBoundary::Absolute => block.min(len - start),
        DqBoundary::Remainder => (len % block).saturating_sub(start).min(block),
    }
}

pub fn backward_q_instance<T: Element, const CAUSAL: bool, const EVEN_M: bool, const EVEN_N: bool>(
    args: &BackwardArgs<'_, T>,
    boundary: DqBoundary,
    pid: ProgramId,
    dq_out: &mut [T],
) {
    let g = &args.geometry;
    let start_m = pid.tile * g.block_m;
    let rows = if EVEN_M || start_m + g.block_m <= g.q_len {
        g.block_m
    } else {
        kept_lanes(boundary, start_m, g.block_m, g.q_len)
    };

    let q = Tile::load(&args.q.head(pid.batch, pid.head), start_m, g.block_m, rows);
    let d_o = Tile::load(&args.d_o.head(pid.batch, pid.head), start_m, g.block_m, rows);
    let l_head = args.log_norm.head(pid.batch, pid.head);
    let delta_head = args.delta.head(pid.batch, pid.head);
    let lse: Vec<f32> = (0..g.block_m)
        .map(|r| if r < rows { l_head.get(start_m + r) } else { 0.0 })
        .collect();
    let delta: Vec<f32> = (0..g.block_m)
        .map(|r| if r < rows { delta_head.get(start_m + r) } else { 0.0 })
        .collect();

    let k_head = args.k.head(pid.batch, pid.head);
    let v_head = args.v.head(pid.batch, pid.head);
    let mut k = Tile::zeros(g.block_n, g.head_dim);
    let mut v = Tile::zeros(g.block_n, g.head_dim);
    let mut s = Tile::zeros(g.block_m, g.block_n);
    let mut dp = Tile::zeros(g.block_m, g.block_n);
    let mut dq = Tile::zeros(g.block_m, g.head_dim);

    let hi = g.key_bound(pid.tile, CAUSAL);
    for start_n in (0..hi).step_by(g.block_n) {
        let cols = if EVEN_N || start_n + g.block_n <= g.k_len {
            g.block_n
        } else {
            kept_lanes(boundary, start_n, g.block_n, g.k_len)
        };
        k.reload(&k_head, start_n, cols);
        v.reload(&v_head, start_n, cols);

        matmul_nt(&q, &k, &mut s);
        matmul_nt(&d_o, &v, &mut dp);
        for r in 0..g.block_m {
            let s_row = s.row(r);
            for (c, value) in dp.row_mut(r).iter_mut().enumerate() {
                let masked = r >= rows
                    || c >= cols
                    || (CAUSAL && is_masked(start_m + r, start_n + c, g.prefix_len));
                *value = if masked {
                    0.0
                } else {
                    let p = (s_row[c] * g.scale - lse[r]).exp();
                    p * (*value - delta[r])
                };
            }
        }
        // dp now holds ds
        dp.quantize::<T>();
        matmul_nn_acc(&dp, &k, &mut dq);
    }

    dq.scale(g.scale);
    dq.store(rows, dq_out);
}
