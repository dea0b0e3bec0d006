//! Explicit execution context handed to every fused call.

use std::sync::Arc;

use candle_core::Device;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::core::AttentionError;
use crate::tuning::Architecture;

/// Device, tuning architecture and worker pool a call runs on.
///
/// Nothing here is process-wide: two contexts with different pools can be
/// used concurrently from different threads.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    device: Device,
    architecture: Architecture,
    pool: Option<Arc<ThreadPool>>,
}

impl ExecutionContext {
    /// Host execution on rayon's global pool.
    pub fn host() -> Self {
        Self {
            device: Device::Cpu,
            architecture: Architecture::Host,
            pool: None,
        }
    }

    /// Run launches on a dedicated pool of `threads` workers.
    pub fn with_threads(mut self, threads: usize) -> Result<Self, AttentionError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("flash-attn-{i}"))
            .build()
            .map_err(|err| AttentionError::Backend {
                message: format!("failed to build thread pool: {err}"),
            })?;
        self.pool = Some(Arc::new(pool));
        Ok(self)
    }

    /// Tune as if running on `architecture`.
    pub fn with_architecture(mut self, architecture: Architecture) -> Self {
        self.architecture = architecture;
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// Number of workers launches fan out to.
    pub fn threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }

    /// Execute `op` inside this context's pool.
    pub fn install<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    /// Ensure operands live on the context's device.
    pub(crate) fn check_device(&self, device: &Device) -> Result<(), AttentionError> {
        if !self.device.same_device(device) {
            return Err(AttentionError::Backend {
                message: format!(
                    "context targets {:?} but operands live on {:?}",
                    self.device.location(),
                    device.location()
                ),
            });
        }
        Ok(())
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::host()
    }
}
