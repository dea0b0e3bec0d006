//! Tiled streaming-softmax attention with a recomputation-based backward pass.
//!
//! Inputs use the logical layout `[batch, n_heads, seq_len, head_dim]` with any
//! physical stride order; `Q`, `K`, and `V` share one dtype (`f16`, `bf16`, or
//! `f32`) and a head dimension in `{16, 32, 64, 128}`. Keys and values may
//! carry a prefix of extra leading positions (`k_len - q_len`) that every
//! query can see, including under causal masking.
//!
//! The forward pass never materialises the score matrix: each
//! `(query tile, head, batch)` instance keeps a running max and denominator
//! and emits the output together with a per-row log-normalizer `L`. The
//! backward pass recomputes probabilities from `L` instead of storing them.
//! All reductions accumulate in `f32`.
//!
//! ```no_run
//! use candle_core::{DType, Device, Tensor};
//! use flash_attention::{flash_attention, flash_attention_backward};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let q = Tensor::randn(0f32, 1.0, (1, 8, 128, 64), &Device::Cpu)?.to_dtype(DType::F16)?;
//! let k = Tensor::randn(0f32, 1.0, (1, 8, 160, 64), &Device::Cpu)?.to_dtype(DType::F16)?;
//! let v = Tensor::randn(0f32, 1.0, (1, 8, 160, 64), &Device::Cpu)?.to_dtype(DType::F16)?;
//! let fwd = flash_attention(&q, &k, &v, true, None)?;
//! let grads = flash_attention_backward(&fwd.saved, &fwd.output.ones_like()?)?;
//! assert_eq!(grads.dk.dims(), k.dims());
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod kernels;
pub mod launch;
pub mod layout;
pub mod masks;
pub mod reference;
pub mod testing;
pub mod tuning;

pub use crate::core::{Attention, AttentionError, Config, DqBoundary};
pub use launch::{
    flash_attention, flash_attention_backward, ExecutionContext, FlashAttention, ForwardOutput,
    Gradients, SavedForward,
};
pub use tuning::{Architecture, TileConfig, TuningPolicy};
