//! Backward preprocessing: `delta[m] = sum_d O[m, d] * dO[m, d]`.

use crate::kernels::{Element, Geometry, ProgramId};
use crate::layout::TensorView;

#[derive(Debug, Clone, Copy)]
pub struct PreprocessArgs<'a, T> {
    pub o: TensorView<'a, T>,
    pub d_o: TensorView<'a, T>,
    pub geometry: Geometry,
}

pub type PreprocessFn<T> = fn(&PreprocessArgs<'_, T>, ProgramId, &mut [f32]);

pub fn select<T: Element>(even_m: bool) -> PreprocessFn<T> {
    if even_m {
        preprocess_instance::<T, true> as PreprocessFn<T>
    } else {
        preprocess_instance::<T, false> as PreprocessFn<T>
    }
}

pub fn preprocess_instance<T: Element, const EVEN_M: bool>(
    args: &PreprocessArgs<'_, T>,
    pid: ProgramId,
    delta: &mut [f32],
) {
    let g = &args.geometry;
    let start_m = pid.tile * g.block_m;
    let rows = if EVEN_M { g.block_m } else { g.valid_rows(start_m) };

    let o_head = args.o.head(pid.batch, pid.head);
    let do_head = args.d_o.head(pid.batch, pid.head);
    let mut o_row = vec![0f32; g.head_dim];
    let mut do_row = vec![0f32; g.head_dim];

    for (r, slot) in delta.iter_mut().enumerate().take(rows) {
        o_head.load_row(start_m + r, &mut o_row);
        do_head.load_row(start_m + r, &mut do_row);
        *slot = o_row.iter().zip(do_row.iter()).map(|(a, b)| a * b).sum();
    }
}
