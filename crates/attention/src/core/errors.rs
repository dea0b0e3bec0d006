//! Error types emitted by the fused attention entry points.

use thiserror::Error;

/// Attention-specific error category.
///
/// Precondition failures (`InvalidShape`, `UnsupportedDType`,
/// `UnsupportedHeadDim`, `NegativePrefix`, `InvalidConfig`) are raised before
/// any output is allocated. `Backend` covers allocation and launch failures;
/// a call that fails never hands back partial results.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {context}")]
    InvalidShape { context: String },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// Head dimension outside of the supported set.
    #[error("unsupported head dimension {head_dim}, expected one of 16, 32, 64, 128")]
    UnsupportedHeadDim { head_dim: usize },
    /// Causal attention requested with fewer keys than queries.
    #[error("causal attention needs k_len >= q_len, got q_len={q_len} k_len={k_len}")]
    NegativePrefix { q_len: usize, k_len: usize },
    /// Scale factor or tile configuration rejected.
    #[error("invalid configuration: {context}")]
    InvalidConfig { context: String },
    /// A backend-specific failure propagated to the caller.
    #[error("{message}")]
    Backend { message: String },
}

impl From<candle_core::Error> for AttentionError {
    fn from(err: candle_core::Error) -> Self {
        AttentionError::Backend {
            message: err.to_string(),
        }
    }
}
