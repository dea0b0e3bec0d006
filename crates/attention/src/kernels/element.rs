//! Storage element types understood by the kernels.
//!
//! Operands live in their storage dtype and are widened to `f32` on load;
//! every accumulator is `f32`. Probabilities and score gradients are rounded
//! back through the storage dtype before they feed a matrix product, like a
//! mixed-precision tensor-core kernel would.

use candle_core::WithDType;
use half::{bf16, f16};

pub trait Element: WithDType {
    fn to_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;

    /// Round `value` to storage precision and widen it again.
    #[inline]
    fn quantize(value: f32) -> f32 {
        Self::from_f32(value).to_f32()
    }
}

impl Element for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }

    #[inline]
    fn quantize(value: f32) -> f32 {
        value
    }
}

impl Element for f16 {
    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }
}

impl Element for bf16 {
    #[inline]
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        bf16::from_f32(value)
    }
}
