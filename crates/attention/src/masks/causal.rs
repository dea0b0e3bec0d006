//! Causal visibility with a key prefix.
//!
//! Keys may outnumber queries; the surplus `prefix_len = k_len - q_len`
//! positions are visible to every query, and query `i` additionally sees keys
//! up to `prefix_len + i`. The fused kernels evaluate [`is_masked`] per score,
//! the reference path materialises the same rule with [`build_causal_mask`].

use candle_core::{Device, Result, Tensor};

/// `true` when `key_col` lies in the future of `query_row`.
#[inline]
pub fn is_masked(query_row: usize, key_col: usize, prefix_len: usize) -> bool {
    key_col > prefix_len + query_row
}

/// Additive `[q_len, k_len]` mask broadcastable over batch and heads.
///
/// Entries are `0.0` where attention is permitted and `f32::NEG_INFINITY`
/// otherwise.
pub fn build_causal_mask(device: &Device, q_len: usize, k_len: usize) -> Result<Tensor> {
    let prefix_len = k_len.saturating_sub(q_len);
    let data: Vec<f32> = (0..q_len)
        .flat_map(|q| {
            (0..k_len).map(move |k| {
                if is_masked(q, k, prefix_len) {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    Tensor::from_vec(data, (q_len, k_len), device)
}
