//! Tile-size selection for the fused kernels.
//!
//! The orchestrator treats the tuning policy as an opaque collaborator: given
//! the architecture, causal flag, head dimension and sequence length it yields
//! a [`TileConfig`]. The bundled [`TableTuning`] resolves the request against a
//! declarative rule table and falls back to [`TileConfig::CONSERVATIVE`] when
//! no rule matches.

pub mod table;

use serde::{Deserialize, Serialize};

use crate::core::AttentionError;

/// Tile shape and pipelining hints consumed by a kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileConfig {
    /// Query rows processed per grid instance.
    pub block_m: usize,
    /// Key/value rows processed per inner-loop step.
    pub block_n: usize,
    /// Software pipelining depth.
    pub num_stages: usize,
    /// Parallel lanes per instance.
    pub num_warps: usize,
}

impl TileConfig {
    /// Fallback used for architectures without a dedicated table entry.
    pub const CONSERVATIVE: TileConfig = TileConfig::new(32, 32, 2, 4);

    pub const fn new(block_m: usize, block_n: usize, num_stages: usize, num_warps: usize) -> Self {
        Self {
            block_m,
            block_n,
            num_stages,
            num_warps,
        }
    }

    /// Override only the tile extents, keeping the pipelining hints.
    pub fn with_blocks(mut self, block_m: usize, block_n: usize) -> Self {
        self.block_m = block_m;
        self.block_n = block_n;
        self
    }

    pub fn validate(&self) -> Result<(), AttentionError> {
        if self.block_m == 0 || self.block_n == 0 {
            return Err(AttentionError::InvalidConfig {
                context: format!(
                    "tile extents must be non-zero, got block_m={} block_n={}",
                    self.block_m, self.block_n
                ),
            });
        }
        Ok(())
    }
}

/// Accelerator generation the launch is tuned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    /// Compute capability 8.0 (A100 class).
    Sm80,
    /// Compute capability 8.6 (RTX 30xx class).
    Sm86,
    /// Any other accelerator, identified by compute capability.
    Other(u32, u32),
    /// Host execution engine.
    Host,
}

impl Architecture {
    pub fn from_capability(major: u32, minor: u32) -> Self {
        match (major, minor) {
            (8, 0) => Architecture::Sm80,
            (8, 6) => Architecture::Sm86,
            (major, minor) => Architecture::Other(major, minor),
        }
    }
}

/// Which pass a configuration is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pass {
    Forward,
    Backward,
}

/// Inputs of a tuning lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TuningKey {
    pub architecture: Architecture,
    pub causal: bool,
    pub head_dim: usize,
    pub seq_len: usize,
}

/// Maps a launch description to a tile configuration.
///
/// Implementations must be pure and must answer for every supported head
/// dimension.
pub trait TuningPolicy: Send + Sync {
    fn select(&self, pass: Pass, key: &TuningKey) -> TileConfig;
}

/// Policy backed by the static rule tables in [`table`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TableTuning;

impl TuningPolicy for TableTuning {
    fn select(&self, pass: Pass, key: &TuningKey) -> TileConfig {
        table::lookup(table::rules_for(pass), key).unwrap_or(TileConfig::CONSERVATIVE)
    }
}
