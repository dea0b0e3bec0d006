//! Reference attention with a fully materialised score matrix.
//!
//! The exact path prioritises numerical fidelity and mirrors the semantics
//! described by the [`Attention`](crate::core::Attention) trait. With
//! `upcast` every operand is widened to `f64` first. Without it the math runs
//! in `f32` but scores, probabilities and the output are rounded to the
//! storage dtype after each step, which is the unfused same-precision
//! baseline the fused kernels are measured against.

use std::sync::OnceLock;

use candle_core::{DType, Tensor, Var, D};
use candle_nn::ops::softmax;

use crate::core::checks::{expect_like_query, validate_qkv};
use crate::core::{Attention, AttentionError, Config};
use crate::masks::{build_causal_mask, MASK_DTYPE};

/// Arithmetic dtype, plus the dtype intermediates are rounded through.
fn precision(dtype: DType, upcast: bool) -> (DType, Option<DType>) {
    match (upcast, dtype) {
        (true, _) => (DType::F64, None),
        (false, DType::F16 | DType::BF16) => (DType::F32, Some(dtype)),
        (false, other) => (other, None),
    }
}

fn round(tensor: Tensor, storage: Option<DType>) -> candle_core::Result<Tensor> {
    match storage {
        Some(dtype) => tensor.to_dtype(dtype)?.to_dtype(tensor.dtype()),
        None => Ok(tensor),
    }
}

/// `softmax(q k^T * scale + mask) v` in the dtype of the inputs.
fn materialised(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    causal: bool,
    scale: f32,
    storage: Option<DType>,
) -> candle_core::Result<Tensor> {
    let (batch, heads, q_len, head_dim) = q.dims4()?;
    let k_len = k.dim(2)?;
    let merged = batch * heads;

    let q = q.contiguous()?.reshape((merged, q_len, head_dim))?;
    let k = k.contiguous()?.reshape((merged, k_len, head_dim))?;
    let v = v.contiguous()?.reshape((merged, k_len, head_dim))?;

    let k_t = k.transpose(1, 2)?.contiguous()?;
    let mut scores = round(q.matmul(&k_t)?.affine(scale as f64, 0.0)?, storage)?;
    if causal {
        let mask = build_causal_mask(q.device(), q_len, k_len)?;
        debug_assert_eq!(mask.dtype(), MASK_DTYPE);
        scores = scores.broadcast_add(&mask.to_dtype(scores.dtype())?)?;
    }
    let probs = round(softmax(&scores, D::Minus1)?, storage)?;
    round(probs.matmul(&v)?, storage)?.reshape((batch, heads, q_len, head_dim))
}

/// Forward reference. Returns a tensor in the dtype of `q`.
pub fn attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    causal: bool,
    scale: Option<f32>,
    upcast: bool,
) -> Result<Tensor, AttentionError> {
    let config = Config {
        causal,
        scale,
        ..Config::default()
    };
    let shape = validate_qkv(q, k, v, &config)?;
    let (work, storage) = precision(shape.dtype, upcast);
    let out = materialised(
        &q.to_dtype(work)?,
        &k.to_dtype(work)?,
        &v.to_dtype(work)?,
        causal,
        config.resolved_scale(shape.head_dim),
        storage,
    )?;
    Ok(out.to_dtype(shape.dtype)?)
}

/// Gradients of `sum(attention(q, k, v) * d_o)` by autograd.
///
/// Returns `(dq, dk, dv)` in the dtype of `q`.
pub fn attention_backward(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    d_o: &Tensor,
    causal: bool,
    scale: Option<f32>,
    upcast: bool,
) -> Result<(Tensor, Tensor, Tensor), AttentionError> {
    let config = Config {
        causal,
        scale,
        ..Config::default()
    };
    let shape = validate_qkv(q, k, v, &config)?;
    expect_like_query(d_o, &shape, q.device(), "do")?;
    let (work, storage) = precision(shape.dtype, upcast);

    let q_var = Var::from_tensor(&q.to_dtype(work)?)?;
    let k_var = Var::from_tensor(&k.to_dtype(work)?)?;
    let v_var = Var::from_tensor(&v.to_dtype(work)?)?;
    let out = materialised(
        q_var.as_tensor(),
        k_var.as_tensor(),
        v_var.as_tensor(),
        causal,
        config.resolved_scale(shape.head_dim),
        storage,
    )?;
    let loss = out.mul(&d_o.to_dtype(work)?)?.sum_all()?;
    let grads = loss.backward()?;

    let grad = |var: &Var, name: &str| -> Result<Tensor, AttentionError> {
        let grad = grads.get(var.as_tensor()).ok_or_else(|| AttentionError::Backend {
            message: format!("autograd produced no gradient for {name}"),
        })?;
        Ok(grad.to_dtype(shape.dtype)?)
    };
    Ok((grad(&q_var, "q")?, grad(&k_var, "k")?, grad(&v_var, "v")?))
}

/// [`Attention`] implementation over [`attention`].
#[derive(Debug, Default)]
pub struct ExactAttention {
    upcast: bool,
    first_call: OnceLock<()>,
}

impl ExactAttention {
    /// Compute in the storage dtype.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute in `f64` and cast the result back.
    pub fn upcast() -> Self {
        Self {
            upcast: true,
            first_call: OnceLock::new(),
        }
    }
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init upcast={} causal={} scale={:?}",
                self.upcast,
                config.causal,
                config.scale
            );
        }
        attention(q, k, v, config.causal, config.scale, self.upcast)
    }
}
