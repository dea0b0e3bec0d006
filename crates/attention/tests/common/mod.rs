#![allow(dead_code)]

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Uniform(-1, 1) tensor of `shape`, cast to `dtype`.
pub fn random(rng: &mut StdRng, shape: &[usize], dtype: DType) -> Result<Tensor> {
    let len = shape.iter().product();
    let data: Vec<f32> = (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    Ok(Tensor::from_vec(data, shape, &Device::Cpu)?.to_dtype(dtype)?)
}

/// `q` as `[batch, heads, q_len, head_dim]`, `k`/`v` as `[batch, heads, k_len, head_dim]`.
pub fn qkv(
    seed: u64,
    (batch, heads, q_len, k_len, head_dim): (usize, usize, usize, usize, usize),
    dtype: DType,
) -> Result<(Tensor, Tensor, Tensor)> {
    let mut rng = rng(seed);
    let q = random(&mut rng, &[batch, heads, q_len, head_dim], dtype)?;
    let k = random(&mut rng, &[batch, heads, k_len, head_dim], dtype)?;
    let v = random(&mut rng, &[batch, heads, k_len, head_dim], dtype)?;
    Ok((q, k, v))
}

pub fn to_f32_vec(tensor: &Tensor) -> Result<Vec<f32>> {
    Ok(tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
}

pub fn max_abs(tensor: &Tensor) -> Result<f32> {
    Ok(to_f32_vec(tensor)?.iter().fold(0f32, |acc, x| acc.max(x.abs())))
}
