//! Portable, exact attention.
//!
//! These paths favour clarity over performance and serve as the baseline for
//! validating the fused kernels, forward and backward.

pub mod exact;

pub use exact::{attention, attention_backward, ExactAttention};
