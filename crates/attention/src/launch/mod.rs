//! Launch orchestration for the fused forward and backward passes.
//!
//! The orchestrator validates every operand up front, resolves tile sizes
//! through the [`TuningPolicy`], fetches the matching kernel variants from the
//! [`KernelCache`] and fans the grid out over the context's worker pool.
//! Backward runs Preprocess to completion first, then the KV and Q kernels
//! concurrently; they read the same inputs and write disjoint outputs.

pub mod cache;
pub mod context;
pub mod grid;

use std::sync::{Arc, OnceLock};

use candle_core::{DType, Device, Tensor};
use half::{bf16, f16};

use crate::core::checks::{expect_like_query, expect_row_statistic, validate_qkv};
use crate::core::{Attention, AttentionError, Config, DqBoundary, ProblemShape};
use crate::kernels::backward_kv::BackwardArgs;
use crate::kernels::forward::ForwardArgs;
use crate::kernels::preprocess::PreprocessArgs;
use crate::kernels::{backward_kv, backward_q, forward, preprocess, Element, Geometry, Specialization};
use crate::layout::{HostTensor, RowStatView};
use crate::tuning::{Pass, TableTuning, TileConfig, TuningKey, TuningPolicy};

pub use cache::{CacheStats, KernelCache, KernelKind, SpecializationKey};
pub use context::ExecutionContext;
pub use grid::{dispatch, split_tiles, LaunchGrid};

/// Operands the backward pass needs from a forward call.
#[derive(Debug, Clone)]
pub struct SavedForward {
    q: Tensor,
    k: Tensor,
    v: Tensor,
    output: Tensor,
    log_normalizer: Tensor,
    causal: bool,
    scale: f32,
}

impl SavedForward {
    /// Assemble saved state by hand, for example after checkpointing `O`
    /// and `L` separately. Shapes are checked when backward runs.
    pub fn new(
        q: Tensor,
        k: Tensor,
        v: Tensor,
        output: Tensor,
        log_normalizer: Tensor,
        causal: bool,
        scale: f32,
    ) -> Self {
        Self {
            q,
            k,
            v,
            output,
            log_normalizer,
            causal,
            scale,
        }
    }

    pub fn q(&self) -> &Tensor {
        &self.q
    }

    pub fn k(&self) -> &Tensor {
        &self.k
    }

    pub fn v(&self) -> &Tensor {
        &self.v
    }

    pub fn output(&self) -> &Tensor {
        &self.output
    }

    pub fn log_normalizer(&self) -> &Tensor {
        &self.log_normalizer
    }

    pub fn causal(&self) -> bool {
        self.causal
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }
}

/// Result of a forward call.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// `[batch, heads, q_len, head_dim]` in the input dtype.
    pub output: Tensor,
    /// `[batch, heads, q_len]` in `f32`.
    pub log_normalizer: Tensor,
    pub saved: SavedForward,
}

/// Gradients with the shapes and dtype of `q`, `k` and `v`.
#[derive(Debug, Clone)]
pub struct Gradients {
    pub dq: Tensor,
    pub dk: Tensor,
    pub dv: Tensor,
}

/// Fused attention entry point.
pub struct FlashAttention {
    policy: Arc<dyn TuningPolicy>,
    cache: Arc<KernelCache>,
    first_call: OnceLock<()>,
}

impl std::fmt::Debug for FlashAttention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashAttention")
            .field("cache", &self.cache.stats())
            .finish_non_exhaustive()
    }
}

impl Default for FlashAttention {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashAttention {
    /// Table-driven tuning and the process-wide kernel cache.
    pub fn new() -> Self {
        Self::with_policy(Arc::new(TableTuning))
    }

    pub fn with_policy(policy: Arc<dyn TuningPolicy>) -> Self {
        Self {
            policy,
            cache: KernelCache::shared(),
            first_call: OnceLock::new(),
        }
    }

    /// Use a private kernel cache instead of the shared one.
    pub fn with_cache(mut self, cache: Arc<KernelCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &KernelCache {
        &self.cache
    }

    /// Compute `O` and `L` for `q`, `k`, `v`.
    pub fn forward(
        &self,
        ctx: &ExecutionContext,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        config: &Config,
    ) -> Result<ForwardOutput, AttentionError> {
        let shape = validate_qkv(q, k, v, config)?;
        ctx.check_device(q.device())?;
        self.log_first_call(ctx, config);

        let scale = config.resolved_scale(shape.head_dim);
        let tiles = self.tiles(ctx, Pass::Forward, config, &shape);
        let geometry = geometry(&shape, &tiles, scale);

        let (output, log_normalizer) = match shape.dtype {
            DType::F16 => self.forward_typed::<f16>(ctx, q, k, v, &shape, tiles, geometry, config.causal)?,
            DType::BF16 => self.forward_typed::<bf16>(ctx, q, k, v, &shape, tiles, geometry, config.causal)?,
            DType::F32 => self.forward_typed::<f32>(ctx, q, k, v, &shape, tiles, geometry, config.causal)?,
            other => {
                return Err(AttentionError::UnsupportedDType {
                    requested: format!("{other:?}"),
                })
            }
        };

        let saved = SavedForward::new(
            q.clone(),
            k.clone(),
            v.clone(),
            output.clone(),
            log_normalizer.clone(),
            config.causal,
            scale,
        );
        Ok(ForwardOutput {
            output,
            log_normalizer,
            saved,
        })
    }

    /// Compute `(dq, dk, dv)` from the saved forward state and `d_o`.
    ///
    /// Causality and scale come from `saved`; `config` only contributes tile
    /// overrides and the dQ boundary mode.
    pub fn backward(
        &self,
        ctx: &ExecutionContext,
        saved: &SavedForward,
        d_o: &Tensor,
        config: &Config,
    ) -> Result<Gradients, AttentionError> {
        let mut cfg = config.clone();
        cfg.causal = saved.causal;
        cfg.scale = Some(saved.scale);
        let shape = validate_qkv(&saved.q, &saved.k, &saved.v, &cfg)?;
        expect_like_query(&saved.output, &shape, saved.q.device(), "o")?;
        expect_like_query(d_o, &shape, saved.q.device(), "do")?;
        expect_row_statistic(&saved.log_normalizer, &shape, "log_normalizer")?;
        ctx.check_device(saved.q.device())?;
        self.log_first_call(ctx, &cfg);

        let tiles = self.tiles(ctx, Pass::Backward, &cfg, &shape);
        let geometry = geometry(&shape, &tiles, saved.scale);

        match shape.dtype {
            DType::F16 => self.backward_typed::<f16>(ctx, saved, d_o, &shape, tiles, geometry, cfg.dq_boundary),
            DType::BF16 => self.backward_typed::<bf16>(ctx, saved, d_o, &shape, tiles, geometry, cfg.dq_boundary),
            DType::F32 => self.backward_typed::<f32>(ctx, saved, d_o, &shape, tiles, geometry, cfg.dq_boundary),
            other => Err(AttentionError::UnsupportedDType {
                requested: format!("{other:?}"),
            }),
        }
    }

    fn log_first_call(&self, ctx: &ExecutionContext, cfg: &Config) {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "flash_attention init architecture={:?} threads={} causal={} scale={:?} forward_tiles={:?} backward_tiles={:?} dq_boundary={:?}",
                ctx.architecture(),
                ctx.threads(),
                cfg.causal,
                cfg.scale,
                cfg.forward_tiles,
                cfg.backward_tiles,
                cfg.dq_boundary
            );
        }
    }

    fn tiles(&self, ctx: &ExecutionContext, pass: Pass, cfg: &Config, shape: &ProblemShape) -> TileConfig {
        let pinned = match pass {
            Pass::Forward => cfg.forward_tiles,
            Pass::Backward => cfg.backward_tiles,
        };
        pinned.unwrap_or_else(|| {
            self.policy.select(
                pass,
                &TuningKey {
                    architecture: ctx.architecture(),
                    causal: cfg.causal,
                    head_dim: shape.head_dim,
                    seq_len: shape.q_len,
                },
            )
        })
    }

    fn key(
        &self,
        kernel: KernelKind,
        shape: &ProblemShape,
        tiles: TileConfig,
        spec: Specialization,
    ) -> SpecializationKey {
        SpecializationKey {
            kernel,
            dtype: shape.dtype,
            head_dim: shape.head_dim,
            tiles,
            spec,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn forward_typed<T: Element>(
        &self,
        ctx: &ExecutionContext,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        shape: &ProblemShape,
        tiles: TileConfig,
        geometry: Geometry,
        causal: bool,
    ) -> Result<(Tensor, Tensor), AttentionError> {
        let spec = Specialization::new(causal, &geometry);
        let kernel = self
            .cache
            .get_or_build(self.key(KernelKind::Forward, shape, tiles, spec), || {
                forward::select::<T>(spec)
            })?;

        let (q_host, k_host, v_host) = (HostTensor::borrow(q)?, HostTensor::borrow(k)?, HostTensor::borrow(v)?);
        let args = ForwardArgs {
            q: q_host.view::<T, 4>()?,
            k: k_host.view::<T, 4>()?,
            v: v_host.view::<T, 4>()?,
            geometry,
        };

        let ProblemShape {
            batch,
            heads,
            q_len,
            head_dim,
            ..
        } = *shape;
        let mut out = vec![T::from_f32(0.0); batch * heads * q_len * head_dim];
        let mut lse = vec![0f32; batch * heads * q_len];

        let grid = LaunchGrid::new(q_len, geometry.block_m, heads, batch);
        log::trace!("forward launch grid={grid:?} tiles={tiles:?} spec={spec:?}");
        let regions: Vec<_> = split_tiles(&mut out, &grid, q_len, geometry.block_m, head_dim)
            .into_iter()
            .zip(split_tiles(&mut lse, &grid, q_len, geometry.block_m, 1))
            .collect();
        ctx.install(|| {
            dispatch(&grid, regions, |pid, (o, l)| kernel(&args, pid, o, l));
        });

        let device = Device::Cpu;
        let output = Tensor::from_vec(out, (batch, heads, q_len, head_dim), &device)?;
        let log_normalizer = Tensor::from_vec(lse, (batch, heads, q_len), &device)?;
        Ok((output, log_normalizer))
    }

    #[allow(clippy::too_many_arguments)]
    fn backward_typed<T: Element>(
        &self,
        ctx: &ExecutionContext,
        saved: &SavedForward,
        d_o: &Tensor,
        shape: &ProblemShape,
        tiles: TileConfig,
        geometry: Geometry,
        boundary: DqBoundary,
    ) -> Result<Gradients, AttentionError> {
        let spec = Specialization::new(saved.causal, &geometry);
        let pre = self
            .cache
            .get_or_build(self.key(KernelKind::Preprocess, shape, tiles, spec), || {
                preprocess::select::<T>(spec.even_m)
            })?;
        let kv_kernel = self
            .cache
            .get_or_build(self.key(KernelKind::BackwardKv, shape, tiles, spec), || {
                backward_kv::select::<T>(spec)
            })?;
        let q_kernel = self
            .cache
            .get_or_build(self.key(KernelKind::BackwardQ, shape, tiles, spec), || {
                backward_q::select::<T>(spec)
            })?;

        let ProblemShape {
            batch,
            heads,
            q_len,
            k_len,
            head_dim,
            ..
        } = *shape;
        let (block_m, block_n) = (geometry.block_m, geometry.block_n);

        let q_host = HostTensor::borrow(&saved.q)?;
        let k_host = HostTensor::borrow(&saved.k)?;
        let v_host = HostTensor::borrow(&saved.v)?;
        let o_host = HostTensor::borrow(&saved.output)?;
        let l_host = HostTensor::borrow(&saved.log_normalizer)?;
        let do_host = HostTensor::borrow(d_o)?;

        let d_o = do_host.view::<T, 4>()?;
        let pre_args = PreprocessArgs {
            o: o_host.view::<T, 4>()?,
            d_o,
            geometry,
        };
        let mut delta = vec![0f32; batch * heads * q_len];
        let q_grid = LaunchGrid::new(q_len, block_m, heads, batch);
        log::trace!("preprocess launch grid={q_grid:?} tiles={tiles:?}");
        let regions = split_tiles(&mut delta, &q_grid, q_len, block_m, 1);
        ctx.install(|| {
            dispatch(&q_grid, regions, |pid, d| pre(&pre_args, pid, d));
        });

        let args = BackwardArgs {
            q: q_host.view::<T, 4>()?,
            k: k_host.view::<T, 4>()?,
            v: v_host.view::<T, 4>()?,
            d_o,
            log_norm: l_host.view::<f32, 3>()?,
            delta: RowStatView::contiguous(&delta, [batch, heads, q_len]),
            geometry,
        };

        let zero = T::from_f32(0.0);
        let mut dq = vec![zero; batch * heads * q_len * head_dim];
        let mut dk = vec![zero; batch * heads * k_len * head_dim];
        let mut dv = vec![zero; batch * heads * k_len * head_dim];

        let kv_grid = LaunchGrid::new(k_len, block_n, heads, batch);
        log::trace!(
            "backward launch kv_grid={kv_grid:?} q_grid={q_grid:?} tiles={tiles:?} spec={spec:?} dq_boundary={boundary:?}"
        );
        let kv_regions: Vec<_> = split_tiles(&mut dk, &kv_grid, k_len, block_n, head_dim)
            .into_iter()
            .zip(split_tiles(&mut dv, &kv_grid, k_len, block_n, head_dim))
            .collect();
        let q_regions = split_tiles(&mut dq, &q_grid, q_len, block_m, head_dim);
        ctx.install(|| {
            rayon::join(
                || dispatch(&kv_grid, kv_regions, |pid, (dk, dv)| kv_kernel(&args, pid, dk, dv)),
                || dispatch(&q_grid, q_regions, |pid, dq| q_kernel(&args, boundary, pid, dq)),
            )
        });

        let device = Device::Cpu;
        Ok(Gradients {
            dq: Tensor::from_vec(dq, (batch, heads, q_len, head_dim), &device)?,
            dk: Tensor::from_vec(dk, (batch, heads, k_len, head_dim), &device)?,
            dv: Tensor::from_vec(dv, (batch, heads, k_len, head_dim), &device)?,
        })
    }
}

fn geometry(shape: &ProblemShape, tiles: &TileConfig, scale: f32) -> Geometry {
    Geometry {
        q_len: shape.q_len,
        k_len: shape.k_len,
        prefix_len: shape.prefix_len(),
        head_dim: shape.head_dim,
        block_m: tiles.block_m,
        block_n: tiles.block_n,
        scale,
    }
}

impl Attention for FlashAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        Ok(self
            .forward(&ExecutionContext::host(), q, k, v, config)?
            .output)
    }
}

fn shared() -> &'static FlashAttention {
    static SHARED: OnceLock<FlashAttention> = OnceLock::new();
    SHARED.get_or_init(FlashAttention::new)
}

/// Forward pass on the host context with table tuning.
///
/// `scale` defaults to `1 / sqrt(head_dim)`.
pub fn flash_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    causal: bool,
    scale: Option<f32>,
) -> Result<ForwardOutput, AttentionError> {
    let config = Config {
        causal,
        scale,
        ..Config::default()
    };
    shared().forward(&ExecutionContext::host(), q, k, v, &config)
}

/// Backward pass matching [`flash_attention`].
pub fn flash_attention_backward(saved: &SavedForward, d_o: &Tensor) -> Result<Gradients, AttentionError> {
    shared().backward(&ExecutionContext::host(), saved, d_o, &Config::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_tiles_bypass_the_policy() {
        let attention = FlashAttention::new();
        let ctx = ExecutionContext::host().with_architecture(crate::tuning::Architecture::Sm80);
        let shape = ProblemShape {
            batch: 1,
            heads: 1,
            q_len: 8,
            k_len: 8,
            head_dim: 64,
            dtype: DType::F16,
        };
        let pinned = TileConfig::new(4, 2, 1, 1);
        let cfg = Config::default().with_tiles(pinned);
        assert_eq!(attention.tiles(&ctx, Pass::Forward, &cfg, &shape), pinned);
        assert_eq!(
            attention.tiles(&ctx, Pass::Forward, &Config::default(), &shape),
            TileConfig::new(128, 64, 3, 4)
        );
    }

    #[test]
    fn repeated_calls_hit_the_cache() -> anyhow::Result<()> {
        let attention = FlashAttention::new().with_cache(Arc::new(KernelCache::new()));
        let ctx = ExecutionContext::host();
        let q = Tensor::ones((1, 2, 5, 16), DType::F32, &Device::Cpu)?;
        let cfg = Config::causal().with_tiles(TileConfig::new(2, 2, 1, 1));
        for _ in 0..3 {
            attention.forward(&ctx, &q, &q, &q, &cfg)?;
        }
        let stats = attention.cache().stats();
        assert_eq!((stats.misses, stats.hits, stats.entries), (1, 2, 1));
        Ok(())
    }
}
