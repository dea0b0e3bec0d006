//! Three-axis launch grid and the output partitioning that goes with it.

use rayon::prelude::*;

use crate::kernels::ProgramId;

/// `(tile, head, batch)` grid of one launch.
///
/// Instances are numbered tile-fastest, then head, then batch, which is also
/// the order of contiguous `[batch, heads, seq, width]` output rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGrid {
    pub tiles: usize,
    pub heads: usize,
    pub batch: usize,
}

impl LaunchGrid {
    pub fn new(seq_len: usize, block: usize, heads: usize, batch: usize) -> Self {
        Self {
            tiles: seq_len.div_ceil(block),
            heads,
            batch,
        }
    }

    pub fn len(&self) -> usize {
        self.tiles * self.heads * self.batch
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn program_id(&self, index: usize) -> ProgramId {
        let bh = index / self.tiles;
        ProgramId {
            tile: index % self.tiles,
            head: bh % self.heads,
            batch: bh / self.heads,
        }
    }
}

/// Split a contiguous `[batch, heads, seq_len, width]` buffer into the
/// disjoint regions owned by each instance, in instance order.
pub fn split_tiles<'a, E>(
    buf: &'a mut [E],
    grid: &LaunchGrid,
    seq_len: usize,
    block: usize,
    width: usize,
) -> Vec<&'a mut [E]> {
    if grid.is_empty() || width == 0 {
        return Vec::new();
    }
    buf.chunks_mut(seq_len * width)
        .flat_map(|head| head.chunks_mut(block * width))
        .collect()
}

/// Run `body` once per instance, handing it the instance's output regions.
pub fn dispatch<C, F>(grid: &LaunchGrid, regions: Vec<C>, body: F)
where
    C: Send,
    F: Fn(ProgramId, C) + Sync + Send,
{
    debug_assert_eq!(regions.len(), grid.len());
    regions
        .into_par_iter()
        .enumerate()
        .for_each(|(index, region)| body(grid.program_id(index), region));
}
