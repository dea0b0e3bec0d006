//! Comparison helpers shared by tests and benches.

use candle_core::{DType, Tensor};

use crate::core::AttentionError;

/// Largest absolute element-wise difference, computed in `f32`.
pub fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32, AttentionError> {
    let diff = a.to_dtype(DType::F32)?.sub(&b.to_dtype(DType::F32)?)?;
    if diff.elem_count() == 0 {
        return Ok(0.0);
    }
    Ok(diff.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

/// Percentage of exactly-zero elements.
pub fn zero_percent(tensor: &Tensor) -> Result<f32, AttentionError> {
    let total = tensor.elem_count();
    if total == 0 {
        return Ok(0.0);
    }
    let zeros = tensor
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?
        .iter()
        .filter(|&&x| x == 0.0)
        .count();
    Ok(zeros as f32 * 100.0 / total as f32)
}

/// Fused error must stay within `2 * baseline + tolerance`.
pub fn within_bound(fused: f32, baseline: f32, tolerance: f32) -> bool {
    fused <= 2.0 * baseline + tolerance
}

/// Log how far `fused` and the same-precision `baseline` are from `reference`.
///
/// Returns `(fused_error, baseline_error)`.
pub fn report(name: &str, fused: &Tensor, baseline: &Tensor, reference: &Tensor) -> Result<(f32, f32), AttentionError> {
    let fused_error = max_diff(fused, reference)?;
    let baseline_error = max_diff(baseline, reference)?;
    log::info!(
        "{name}: fused_max_diff={fused_error:.3e} baseline_max_diff={baseline_error:.3e} fused_zero%={:.2} reference_zero%={:.2}",
        zero_percent(fused)?,
        zero_percent(reference)?
    );
    Ok((fused_error, baseline_error))
}
