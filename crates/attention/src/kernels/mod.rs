//! Tile programs for the fused forward and backward passes.
//!
//! Each kernel is written for a single grid instance `(tile, head, batch)`
//! and receives the disjoint output slices that instance owns. Kernels are
//! generic over the storage element and over the `CAUSAL`, `EVEN_M` and
//! `EVEN_N` switches, so every combination is monomorphised once and picked
//! at launch time through [`Specialization`].

pub mod backward_kv;
pub mod backward_q;
pub mod element;
pub mod forward;
pub mod preprocess;
pub mod tile;

pub use element::Element;

/// Coordinates of one grid instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId {
    pub tile: usize,
    pub head: usize,
    pub batch: usize,
}

/// Launch geometry shared by all kernels of one call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    pub q_len: usize,
    pub k_len: usize,
    /// `k_len - q_len` for causal launches, unused otherwise.
    pub prefix_len: usize,
    pub head_dim: usize,
    pub block_m: usize,
    pub block_n: usize,
    pub scale: f32,
}

impl Geometry {
    /// Rows of the query tile starting at `start_m` that lie inside `q_len`.
    #[inline]
    pub fn valid_rows(&self, start_m: usize) -> usize {
        self.block_m.min(self.q_len - start_m)
    }

    /// Rows of the key tile starting at `start_n` that lie inside `k_len`.
    #[inline]
    pub fn valid_cols(&self, start_n: usize) -> usize {
        self.block_n.min(self.k_len - start_n)
    }

    /// Exclusive upper bound of the key sweep for query tile `tile`.
    ///
    /// Causal launches stop after the last key any row of the tile can see.
    #[inline]
    pub fn key_bound(&self, tile: usize, causal: bool) -> usize {
        if causal {
            (self.prefix_len + (tile + 1) * self.block_m).min(self.k_len)
        } else {
            self.k_len
        }
    }

    /// First query row whose tile can see key tile `tile`.
    #[inline]
    pub fn query_floor(&self, tile: usize, causal: bool) -> usize {
        if causal {
            let first = (tile * self.block_n).saturating_sub(self.prefix_len);
            (first / self.block_m) * self.block_m
        } else {
            0
        }
    }
}

/// Compile-time switches a kernel variant is instantiated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Specialization {
    pub causal: bool,
    /// `q_len` is a multiple of `block_m`.
    pub even_m: bool,
    /// `k_len` is a multiple of `block_n`.
    pub even_n: bool,
}

impl Specialization {
    pub fn new(causal: bool, geometry: &Geometry) -> Self {
        Self {
            causal,
            even_m: geometry.q_len % geometry.block_m == 0,
            even_n: geometry.k_len % geometry.block_n == 0,
        }
    }
}

/// Pick the monomorphised variant of `$kernel` matching a [`Specialization`].
macro_rules! specialize {
    ($kernel:ident::<$t:ty>, $spec:expr, $fn_ty:ty) => {
        match ($spec.causal, $spec.even_m, $spec.even_n) {
            (false, false, false) => $kernel::<$t, false, false, false> as $fn_ty,
            (false, false, true) => $kernel::<$t, false, false, true> as $fn_ty,
            (false, true, false) => $kernel::<$t, false, true, false> as $fn_ty,
            (false, true, true) => $kernel::<$t, false, true, true> as $fn_ty,
            (true, false, false) => $kernel::<$t, true, false, false> as $fn_ty,
            (true, false, true) => $kernel::<$t, true, false, true> as $fn_ty,
            (true, true, false) => $kernel::<$t, true, true, false> as $fn_ty,
            (true, true, true) => $kernel::<$t, true, true, true> as $fn_ty,
        }
    };
}

pub(crate) use specialize;
