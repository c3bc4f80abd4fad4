//! Builder for configuring and creating an [`Accelerator`].

use std::sync::Arc;
use std::time::Duration;

use crate::accel::Accelerator;
use crate::backend::HypervisorBackend;
use crate::config::{AccelConfig, OverlapPolicy};
use crate::error::Result;

/// Builder for creating an [`Accelerator`].
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use hvaccel::backend::recording::RecordingBackend;
/// use hvaccel::{Accelerator, OverlapPolicy};
///
/// let accel = Accelerator::builder(RecordingBackend::new())
///     .slot_capacity(128)
///     .overlap_policy(OverlapPolicy::Splitting)
///     .wfi_max_sleep(Duration::from_millis(10))
///     .build()?;
/// # Ok::<(), hvaccel::Error>(())
/// ```
pub struct AccelBuilder<B> {
    backend: B,
    config: AccelConfig,
}

impl<B: HypervisorBackend + 'static> AccelBuilder<B> {
    /// Create a new builder over `backend` with default settings.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            config: AccelConfig::default(),
        }
    }

    /// Start from the environment (`HVACCEL_SLOTS`, `HVACCEL_POLICY`).
    pub fn from_env(mut self) -> Result<Self> {
        self.config = AccelConfig::from_env()?;
        Ok(self)
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: AccelConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of memory slots.
    ///
    /// Default: 512
    pub fn slot_capacity(mut self, slots: usize) -> Self {
        self.config.slot_capacity = slots;
        self
    }

    /// Override the backend's preferred overlap policy.
    pub fn overlap_policy(mut self, policy: OverlapPolicy) -> Self {
        self.config.overlap_policy = Some(policy);
        self
    }

    /// Cap each wait-for-interrupt sleep.
    pub fn wfi_max_sleep(mut self, max: Duration) -> Self {
        self.config.wfi_max_sleep = Some(max);
        self
    }

    /// Build the accelerator.
    pub fn build(self) -> Result<Accelerator<B>> {
        Accelerator::new(Arc::new(self.backend), self.config)
    }
}
