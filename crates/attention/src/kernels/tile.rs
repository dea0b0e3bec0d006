//! Dense `f32` tiles and the three matrix products the kernels need.

use crate::kernels::Element;
use crate::layout::HeadView;

/// Row-major `rows x cols` block of `f32` values.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Tile {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::filled(rows, cols, 0.0)
    }

    pub fn filled(rows: usize, cols: usize, value: f32) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    /// Load `rows` consecutive rows starting at `start`.
    ///
    /// Only the first `valid` rows are read; the rest are zero, so a partial
    /// tile never touches memory past the end of the operand.
    pub fn load<T: Element>(src: &HeadView<'_, T>, start: usize, rows: usize, valid: usize) -> Self {
        let mut tile = Self::zeros(rows, src.cols());
        tile.reload(src, start, valid);
        tile
    }

    /// Refill in place, keeping the tile extents.
    pub fn reload<T: Element>(&mut self, src: &HeadView<'_, T>, start: usize, valid: usize) {
        let valid = valid.min(self.rows);
        for r in 0..self.rows {
            let row = &mut self.data[r * self.cols..(r + 1) * self.cols];
            if r < valid {
                src.load_row(start + r, row);
            } else {
                row.fill(0.0);
            }
        }
    }

    #[inline]
    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    #[inline]
    pub fn row_mut(&mut self, r: usize) -> &mut [f32] {
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn scale(&mut self, factor: f32) {
        for value in &mut self.data {
            *value *= factor;
        }
    }

    /// Round every entry through the storage dtype `T`.
    pub fn quantize<T: Element>(&mut self) {
        for value in &mut self.data {
            *value = T::quantize(*value);
        }
    }

    /// Narrow the first `rows` rows to `T` and write them densely into `out`.
    pub fn store<T: Element>(&self, rows: usize, out: &mut [T]) {
        for (dst, src) in out.iter_mut().zip(self.data[..rows * self.cols].iter()) {
            *dst = T::from_f32(*src);
        }
    }
}

/// `out = a * b^T`.
pub fn matmul_nt(a: &Tile, b: &Tile, out: &mut Tile) {
    debug_assert_eq!(a.cols, b.cols);
    debug_assert_eq!((out.rows, out.cols), (a.rows, b.rows));
    for i in 0..a.rows {
        let lhs = a.row(i);
        for j in 0..b.rows {
            let rhs = b.row(j);
            out.data[i * out.cols + j] = lhs.iter().zip(rhs).map(|(x, y)| x * y).sum();
        }
    }
}

/// `out += a * b`.
pub fn matmul_nn_acc(a: &Tile, b: &Tile, out: &mut Tile) {
    debug_assert_eq!(a.cols, b.rows);
    debug_assert_eq!((out.rows, out.cols), (a.rows, b.cols));
    for i in 0..a.rows {
        for k in 0..a.cols {
            let weight = a.data[i * a.cols + k];
            let rhs = b.row(k);
            let dst = &mut out.data[i * out.cols..(i + 1) * out.cols];
            for (d, r) in dst.iter_mut().zip(rhs) {
                *d += weight * r;
            }
        }
    }
}

/// `out += a^T * b`.
pub fn matmul_tn_acc(a: &Tile, b: &Tile, out: &mut Tile) {
    debug_assert_eq!(a.rows, b.rows);
    debug_assert_eq!((out.rows, out.cols), (a.cols, b.cols));
    for k in 0..a.rows {
        let rhs = b.row(k);
        for i in 0..a.cols {
            let weight = a.data[k * a.cols + i];
            let dst = &mut out.data[i * out.cols..(i + 1) * out.cols];
            for (d, r) in dst.iter_mut().zip(rhs) {
                *d += weight * r;
            }
        }
    }
}
