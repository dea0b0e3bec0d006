//! Stride-aware views over host tensor storage.
//!
//! Kernels address every operand through its logical `[batch, heads, seq,
//! feature]` coordinates; the physical stride order (for example a
//! `[batch, seq, heads, feature]` buffer transposed into logical order) is
//! resolved here once per call, so no input needs to be made contiguous.

use std::sync::RwLockReadGuard;

use candle_core::{Layout, Storage, Tensor};

use crate::core::AttentionError;
use crate::kernels::Element;

/// Read guard over a tensor's host storage.
pub struct HostTensor<'a> {
    storage: RwLockReadGuard<'a, Storage>,
    layout: &'a Layout,
}

impl<'a> HostTensor<'a> {
    pub fn borrow(tensor: &'a Tensor) -> Result<Self, AttentionError> {
        let (storage, layout) = tensor.storage_and_layout();
        if !matches!(&*storage, Storage::Cpu(_)) {
            return Err(AttentionError::Backend {
                message: format!(
                    "no kernels compiled for device {:?}",
                    tensor.device().location()
                ),
            });
        }
        Ok(Self { storage, layout })
    }

    /// Typed view with `R` logical dimensions.
    pub fn view<T: Element, const R: usize>(&self) -> Result<StridedView<'_, T, R>, AttentionError> {
        let data = match &*self.storage {
            Storage::Cpu(cpu) => cpu.as_slice::<T>()?,
            _ => {
                return Err(AttentionError::Backend {
                    message: "tensor storage is not host resident".to_string(),
                })
            }
        };
        let dims: [usize; R] = self.layout.dims().try_into().map_err(|_| AttentionError::InvalidShape {
            context: format!("expected rank {R}, got {:?}", self.layout.dims()),
        })?;
        let strides: [usize; R] = self.layout.stride().try_into().map_err(|_| AttentionError::InvalidShape {
            context: format!("expected rank {R} strides, got {:?}", self.layout.stride()),
        })?;
        Ok(StridedView {
            data,
            offset: self.layout.start_offset(),
            dims,
            strides,
        })
    }
}

/// Logical view over a strided buffer.
#[derive(Debug, Clone, Copy)]
pub struct StridedView<'a, T, const R: usize> {
    data: &'a [T],
    offset: usize,
    dims: [usize; R],
    strides: [usize; R],
}

pub type TensorView<'a, T> = StridedView<'a, T, 4>;
pub type RowStatView<'a> = StridedView<'a, f32, 3>;

impl<'a, T: Element, const R: usize> StridedView<'a, T, R> {
    /// Row-major view over a freshly produced buffer.
    pub fn contiguous(data: &'a [T], dims: [usize; R]) -> Self {
        let mut strides = [1usize; R];
        for axis in (0..R.saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * dims[axis + 1];
        }
        Self {
            data,
            offset: 0,
            dims,
            strides,
        }
    }

    pub fn dims(&self) -> [usize; R] {
        self.dims
    }

    fn position(&self, index: [usize; R]) -> usize {
        index
            .iter()
            .zip(self.strides.iter())
            .fold(self.offset, |acc, (i, s)| acc + i * s)
    }

    pub fn get(&self, index: [usize; R]) -> f32 {
        self.data[self.position(index)].to_f32()
    }
}

impl<'a, T: Element> TensorView<'a, T> {
    /// The `[seq, feature]` matrix of one `(batch, head)` pair.
    pub fn head(&self, batch: usize, head: usize) -> HeadView<'a, T> {
        HeadView {
            data: self.data,
            base: self.offset + batch * self.strides[0] + head * self.strides[1],
            row_stride: self.strides[2],
            col_stride: self.strides[3],
            cols: self.dims[3],
        }
    }
}

impl<'a> RowStatView<'a> {
    /// The per-row statistics of one `(batch, head)` pair.
    pub fn head(&self, batch: usize, head: usize) -> RowStats<'a> {
        RowStats {
            data: self.data,
            base: self.offset + batch * self.strides[0] + head * self.strides[1],
            stride: self.strides[2],
            len: self.dims[2],
        }
    }
}

/// `[seq, feature]` slice of a rank-4 operand.
#[derive(Debug, Clone, Copy)]
pub struct HeadView<'a, T> {
    data: &'a [T],
    base: usize,
    row_stride: usize,
    col_stride: usize,
    cols: usize,
}

impl<'a, T: Element> HeadView<'a, T> {
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Widen one row into `out`.
    pub fn load_row(&self, row: usize, out: &mut [f32]) {
        let start = self.base + row * self.row_stride;
        for (col, slot) in out.iter_mut().enumerate().take(self.cols) {
            *slot = self.data[start + col * self.col_stride].to_f32();
        }
    }
}

/// Per-row `f32` statistics (`L` or `Delta`) of one `(batch, head)` pair.
#[derive(Debug, Clone, Copy)]
pub struct RowStats<'a> {
    data: &'a [f32],
    base: usize,
    stride: usize,
    len: usize,
}

impl<'a> RowStats<'a> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, row: usize) -> f32 {
        self.data[self.base + row * self.stride]
    }
}
