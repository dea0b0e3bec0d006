//! Core traits and types shared across attention implementations.
//!
//! Implementations operate on tensors with logical shape
//! `[batch, n_heads, seq_len, head_dim]`; the physical stride order is free.
//! Keys and values may carry more positions than queries, the surplus being a
//! prefix of cached context. Reductions accumulate in `f32` regardless of the
//! incoming dtype (`f16`, `bf16`, or `f32`).

pub mod checks;
pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use checks::ProblemShape;
pub use config::{Config, DqBoundary};
pub use errors::AttentionError;

/// Unified interface for attention kernels.
///
/// * `q` is `[batch, n_heads, q_len, head_dim]`; `k` and `v` are
///   `[batch, n_heads, k_len, head_dim]`.
/// * The returned tensor mirrors the logical shape and dtype of `q`.
/// * [`Config::causal`] restricts query `i` to keys `j <= (k_len - q_len) + i`.
pub trait Attention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        config: &Config,
    ) -> Result<Tensor, AttentionError>;
}
