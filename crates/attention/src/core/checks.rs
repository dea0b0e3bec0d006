//! Precondition checks run before any launch.
//!
//! Every check returns an [`AttentionError`] rather than panicking so the
//! public entry points can reject a call without performing partial work.

use candle_core::{DType, Tensor};

use crate::core::{AttentionError, Config};

/// Head dimensions the kernels are instantiated for.
pub const SUPPORTED_HEAD_DIMS: [usize; 4] = [16, 32, 64, 128];

/// Storage dtypes accepted by the fused kernels.
pub const SUPPORTED_DTYPES: [DType; 3] = [DType::F16, DType::BF16, DType::F32];

/// Problem geometry resolved from validated inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProblemShape {
    pub batch: usize,
    pub heads: usize,
    pub q_len: usize,
    pub k_len: usize,
    pub head_dim: usize,
    pub dtype: DType,
}

impl ProblemShape {
    /// Leading key positions without a matching query row.
    ///
    /// Only meaningful for causal launches, where `k_len >= q_len` holds.
    pub fn prefix_len(&self) -> usize {
        self.k_len.saturating_sub(self.q_len)
    }
}

/// Splits a tensor into its four logical dimensions.
pub fn expect_rank4(tensor: &Tensor, name: &str) -> Result<(usize, usize, usize, usize), AttentionError> {
    tensor.dims4().map_err(|_| AttentionError::InvalidShape {
        context: format!(
            "{name} must have shape [batch, heads, seq_len, head_dim], got {:?}",
            tensor.dims()
        ),
    })
}

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(tensor: &Tensor, expected: &[usize], name: &str) -> Result<(), AttentionError> {
    if tensor.dims() == expected {
        Ok(())
    } else {
        Err(AttentionError::InvalidShape {
            context: format!("{name}: expected {expected:?}, got {:?}", tensor.dims()),
        })
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(tensor: &Tensor, allowed: &[DType]) -> Result<(), AttentionError> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(AttentionError::UnsupportedDType {
            requested: format!("{dtype:?}, expected one of {allowed:?}"),
        })
    }
}

/// Validates `q`, `k`, `v` against the forward call contract.
pub fn validate_qkv(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    config: &Config,
) -> Result<ProblemShape, AttentionError> {
    config.validate()?;

    let device = q.device();
    if !device.same_device(k.device()) || !device.same_device(v.device()) {
        return Err(AttentionError::InvalidShape {
            context: "q, k, v must reside on the same device".to_string(),
        });
    }

    let dtype = q.dtype();
    if dtype != k.dtype() || dtype != v.dtype() {
        return Err(AttentionError::InvalidShape {
            context: format!(
                "q, k, v must share the same dtype, got {:?}, {:?}, {:?}",
                dtype,
                k.dtype(),
                v.dtype()
            ),
        });
    }
    expect_dtype_in(q, &SUPPORTED_DTYPES)?;

    let (batch, heads, q_len, head_dim) = expect_rank4(q, "q")?;
    let (kb, kh, k_len, kd) = expect_rank4(k, "k")?;
    if kb != batch || kh != heads || kd != head_dim {
        return Err(AttentionError::InvalidShape {
            context: format!(
                "k shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
            ),
        });
    }
    expect_shape(v, &[batch, heads, k_len, head_dim], "v")?;

    if !SUPPORTED_HEAD_DIMS.contains(&head_dim) {
        return Err(AttentionError::UnsupportedHeadDim { head_dim });
    }
    if k_len == 0 {
        return Err(AttentionError::InvalidShape {
            context: "k and v must hold at least one position".to_string(),
        });
    }
    if config.causal && k_len < q_len {
        return Err(AttentionError::NegativePrefix { q_len, k_len });
    }

    Ok(ProblemShape {
        batch,
        heads,
        q_len,
        k_len,
        head_dim,
        dtype,
    })
}

/// Validates a tensor that must mirror `q`'s geometry (`o`, `do`).
pub fn expect_like_query(
    tensor: &Tensor,
    shape: &ProblemShape,
    device: &candle_core::Device,
    name: &str,
) -> Result<(), AttentionError> {
    if !device.same_device(tensor.device()) {
        return Err(AttentionError::InvalidShape {
            context: format!("{name} must reside on the same device as q"),
        });
    }
    if tensor.dtype() != shape.dtype {
        return Err(AttentionError::InvalidShape {
            context: format!(
                "{name} dtype {:?} does not match q dtype {:?}",
                tensor.dtype(),
                shape.dtype
            ),
        });
    }
    expect_shape(
        tensor,
        &[shape.batch, shape.heads, shape.q_len, shape.head_dim],
        name,
    )
}

/// Validates the saved log-normalizer `[batch, heads, q_len]` in `f32`.
pub fn expect_row_statistic(tensor: &Tensor, shape: &ProblemShape, name: &str) -> Result<(), AttentionError> {
    if tensor.dtype() != DType::F32 {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("{name} must be F32, got {:?}", tensor.dtype()),
        });
    }
    expect_shape(tensor, &[shape.batch, shape.heads, shape.q_len], name)
}
