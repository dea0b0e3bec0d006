//! Process-wide memo of resolved kernel variants.
//!
//! Resolving a variant is a `match` today, but the cache is what a device
//! backend would use to hold compiled programs; it also lets callers observe
//! how many distinct specializations a workload touches.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use candle_core::DType;

use crate::core::AttentionError;
use crate::kernels::Specialization;
use crate::tuning::TileConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
    Forward,
    Preprocess,
    BackwardKv,
    BackwardQ,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpecializationKey {
    pub kernel: KernelKind,
    pub dtype: DType,
    pub head_dim: usize,
    pub tiles: TileConfig,
    pub spec: Specialization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Debug, Default)]
pub struct KernelCache {
    entries: Mutex<HashMap<SpecializationKey, Arc<dyn Any + Send + Sync>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl KernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache shared by every [`FlashAttention`](super::FlashAttention) built
    /// with [`FlashAttention::new`](super::FlashAttention::new).
    pub fn shared() -> Arc<KernelCache> {
        static SHARED: OnceLock<Arc<KernelCache>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(KernelCache::new())).clone()
    }

    /// Return the entry for `key`, building it on first use.
    pub fn get_or_build<K, F>(&self, key: SpecializationKey, build: F) -> Result<K, AttentionError>
    where
        K: Copy + Send + Sync + 'static,
        F: FnOnce() -> K,
    {
        let mut entries = self.entries.lock().map_err(|_| AttentionError::Backend {
            message: "kernel cache mutex poisoned".to_string(),
        })?;
        if let Some(kernel) = entries.get(&key).and_then(|entry| entry.downcast_ref::<K>()) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            log::debug!("kernel cache hit {key:?}");
            return Ok(*kernel);
        }
        let kernel = build();
        entries.insert(key, Arc::new(kernel));
        self.misses.fetch_add(1, Ordering::Relaxed);
        log::debug!("kernel cache miss {key:?}");
        Ok(kernel)
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().map(|e| e.len()).unwrap_or_default();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
        }
    }
}
