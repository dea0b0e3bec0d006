//! Declarative tuning rules.
//!
//! Each rule matches on (architecture, causal, head-dim bucket, sequence
//! bucket). Rules are scanned in order and the first match wins.

use super::{Architecture, Pass, TileConfig, TuningKey};

/// Head dimensions up to 64 fit a wider key tile next to the query tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadDimBucket {
    Narrow,
    Wide,
}

impl HeadDimBucket {
    fn matches(self, head_dim: usize) -> bool {
        match self {
            HeadDimBucket::Narrow => head_dim <= 64,
            HeadDimBucket::Wide => head_dim > 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqBucket {
    Short,
    Long,
    Any,
}

impl SeqBucket {
    fn matches(self, seq_len: usize) -> bool {
        match self {
            SeqBucket::Short => seq_len <= 1024,
            SeqBucket::Long => seq_len > 1024,
            SeqBucket::Any => true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TuningRule {
    pub architecture: Architecture,
    pub causal: bool,
    pub head_dim: HeadDimBucket,
    pub seq_len: SeqBucket,
    pub config: TileConfig,
}

const fn rule(
    architecture: Architecture,
    causal: bool,
    head_dim: HeadDimBucket,
    seq_len: SeqBucket,
    config: TileConfig,
) -> TuningRule {
    TuningRule {
        architecture,
        causal,
        head_dim,
        seq_len,
        config,
    }
}

use Architecture::{Sm80, Sm86};
use HeadDimBucket::{Narrow, Wide};
use SeqBucket::{Any, Long, Short};

pub const FORWARD_RULES: &[TuningRule] = &[
    rule(Sm80, false, Narrow, Any, TileConfig::new(128, 64, 3, 4)),
    rule(Sm80, false, Wide, Short, TileConfig::new(128, 32, 3, 4)),
    rule(Sm80, false, Wide, Long, TileConfig::new(128, 128, 3, 8)),
    rule(Sm80, true, Narrow, Any, TileConfig::new(128, 64, 4, 4)),
    rule(Sm80, true, Wide, Short, TileConfig::new(128, 32, 2, 4)),
    rule(Sm80, true, Wide, Long, TileConfig::new(128, 128, 3, 8)),
    rule(Sm86, false, Narrow, Any, TileConfig::new(128, 64, 3, 4)),
    rule(Sm86, false, Wide, Any, TileConfig::new(128, 32, 2, 4)),
    rule(Sm86, true, Narrow, Any, TileConfig::new(64, 64, 3, 4)),
    rule(Sm86, true, Wide, Any, TileConfig::new(128, 32, 2, 4)),
];

pub const BACKWARD_RULES: &[TuningRule] = &[
    rule(Sm80, false, Narrow, Any, TileConfig::new(128, 64, 2, 4)),
    rule(Sm80, false, Wide, Any, TileConfig::new(64, 64, 2, 4)),
    rule(Sm80, true, Narrow, Any, TileConfig::new(64, 64, 3, 4)),
    rule(Sm80, true, Wide, Any, TileConfig::new(64, 64, 2, 4)),
    rule(Sm86, false, Narrow, Any, TileConfig::new(64, 64, 2, 4)),
    rule(Sm86, false, Wide, Any, TileConfig::new(64, 64, 2, 8)),
    rule(Sm86, true, Narrow, Any, TileConfig::new(64, 64, 2, 4)),
    rule(Sm86, true, Wide, Any, TileConfig::new(32, 32, 2, 4)),
];

pub fn rules_for(pass: Pass) -> &'static [TuningRule] {
    match pass {
        Pass::Forward => FORWARD_RULES,
        Pass::Backward => BACKWARD_RULES,
    }
}

/// First rule matching `key`, if any.
pub fn lookup(rules: &[TuningRule], key: &TuningKey) -> Option<TileConfig> {
    rules
        .iter()
        .find(|rule| {
            rule.architecture == key.architecture
                && rule.causal == key.causal
                && rule.head_dim.matches(key.head_dim)
                && rule.seq_len.matches(key.seq_len)
        })
        .map(|rule| rule.config)
}
