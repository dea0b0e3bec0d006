//! Configuration options shared by the fused and reference paths.
//!
//! The [`Config`] struct captures run-time knobs that callers can tune without
//! swapping implementations. Tile overrides bypass the tuning policy, which is
//! mostly useful for exercising boundary tiles in tests and benches.

use std::env;

use serde::{Deserialize, Serialize};

use crate::core::AttentionError;
use crate::tuning::TileConfig;

/// Row mask used by the backward query-gradient kernel on its last tile.
///
/// `Remainder` is the mask of the FlagAttention Triton backward. It zeroes dQ
/// rows of a partial last tile whenever there is more than one query tile,
/// so the default is `Absolute`, which agrees with autograd. Select
/// `Remainder` to match gradients produced by the Triton kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DqBoundary {
    /// Rows are valid while `row < q_len`, like every other kernel.
    #[default]
    Absolute,
    /// Rows are valid while `row < q_len % block_m`, and key columns of the
    /// last partial key tile while `col < k_len % block_n`. Only the first
    /// tile can satisfy these bounds, so trailing rows of a partial last tile
    /// keep a zero gradient.
    Remainder,
}

impl DqBoundary {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "absolute" => Some(DqBoundary::Absolute),
            "remainder" | "legacy" => Some(DqBoundary::Remainder),
            _ => None,
        }
    }
}

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Restrict query `i` to keys `j <= prefix_len + i`.
    pub causal: bool,
    /// Softmax temperature; `None` means `1 / sqrt(head_dim)`.
    pub scale: Option<f32>,
    /// Tile configuration for the forward launch, bypassing the tuning policy.
    pub forward_tiles: Option<TileConfig>,
    /// Tile configuration for the backward launches, bypassing the tuning policy.
    pub backward_tiles: Option<TileConfig>,
    pub dq_boundary: DqBoundary,
}

impl Config {
    pub fn causal() -> Self {
        Self {
            causal: true,
            ..Self::default()
        }
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = Some(scale);
        self
    }

    /// Force the same tiles on every launch.
    pub fn with_tiles(mut self, tiles: TileConfig) -> Self {
        self.forward_tiles = Some(tiles);
        self.backward_tiles = Some(tiles);
        self
    }

    pub fn from_json(raw: &str) -> Result<Self, AttentionError> {
        let config: Config =
            serde_json::from_str(raw).map_err(|err| AttentionError::InvalidConfig {
                context: err.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Scale actually applied for the given head dimension.
    pub fn resolved_scale(&self, head_dim: usize) -> f32 {
        self.scale
            .unwrap_or_else(|| 1.0 / (head_dim as f32).sqrt())
    }

    pub fn validate(&self) -> Result<(), AttentionError> {
        if let Some(scale) = self.scale {
            if !scale.is_finite() || scale <= 0.0 {
                return Err(AttentionError::InvalidConfig {
                    context: format!("scale must be finite and positive, got {scale}"),
                });
            }
        }
        if let Some(tiles) = &self.forward_tiles {
            tiles.validate()?;
        }
        if let Some(tiles) = &self.backward_tiles {
            tiles.validate()?;
        }
        Ok(())
    }

    /// Defaults with the `FLASH_ATTN_*` overrides of the process environment.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Layer `FLASH_ATTN_*` environment overrides on top of `self`.
    ///
    /// `FLASH_ATTN_BLOCK_M`/`FLASH_ATTN_BLOCK_N` pin both passes to the given
    /// tile extents and `FLASH_ATTN_DQ_BOUNDARY` picks the dQ row mask.
    /// Masking and scale belong to the call and are never read from the
    /// environment. Unparsable values are ignored.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|name| env::var(name).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let block_m = read_usize(&lookup, "FLASH_ATTN_BLOCK_M");
        let block_n = read_usize(&lookup, "FLASH_ATTN_BLOCK_N");
        if block_m.is_some() || block_n.is_some() {
            for tiles in [&mut self.forward_tiles, &mut self.backward_tiles] {
                let base = tiles.unwrap_or(TileConfig::CONSERVATIVE);
                *tiles = Some(base.with_blocks(
                    block_m.unwrap_or(base.block_m),
                    block_n.unwrap_or(base.block_n),
                ));
            }
        }

        if let Some(value) = lookup("FLASH_ATTN_DQ_BOUNDARY") {
            match DqBoundary::parse(&value) {
                Some(mode) => self.dq_boundary = mode,
                None => log::warn!("ignoring FLASH_ATTN_DQ_BOUNDARY={value}"),
            }
        }
        self
    }
}

fn read_usize(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<usize> {
    let value = lookup(name)?;
    match value.trim().parse::<usize>() {
        Ok(parsed) if parsed > 0 => Some(parsed),
        _ => {
            log::warn!("ignoring {name}={value}");
            None
        }
    }
}
