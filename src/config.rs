//! Accelerator configuration.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default number of slots in a memory slot table.
pub const DEFAULT_SLOT_CAPACITY: usize = 512;

/// How the slot table resolves a request that overlaps existing slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapPolicy {
    /// Only exact-interval changes are allowed; any other overlap is an
    /// invariant violation. For backends that cannot remap part of a mapping.
    Strict,
    /// Overlapping slots are truncated, freed or split around the request.
    Splitting,
}

impl std::fmt::Display for OverlapPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverlapPolicy::Strict => write!(f, "strict"),
            OverlapPolicy::Splitting => write!(f, "split"),
        }
    }
}

impl std::str::FromStr for OverlapPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(OverlapPolicy::Strict),
            "split" | "splitting" => Ok(OverlapPolicy::Splitting),
            other => Err(Error::InvalidConfig(format!("unknown overlap policy {other:?}"))),
        }
    }
}

/// Configuration for an [`Accelerator`](crate::Accelerator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccelConfig {
    /// Number of slots in the memory slot table.
    pub slot_capacity: usize,
    /// Overlap policy. `None` uses the backend's preference.
    pub overlap_policy: Option<OverlapPolicy>,
    /// Upper bound on a single wait-for-interrupt sleep.
    pub wfi_max_sleep: Option<Duration>,
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self {
            slot_capacity: DEFAULT_SLOT_CAPACITY,
            overlap_policy: None,
            wfi_max_sleep: None,
        }
    }
}

impl AccelConfig {
    /// Defaults overlaid with `HVACCEL_SLOTS` and `HVACCEL_POLICY`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(slots) = std::env::var("HVACCEL_SLOTS") {
            config.slot_capacity = slots
                .trim()
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("HVACCEL_SLOTS={slots:?}")))?;
        }
        if let Ok(policy) = std::env::var("HVACCEL_POLICY") {
            config.overlap_policy = Some(policy.parse()?);
        }
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.slot_capacity == 0 {
            return Err(Error::InvalidConfig("slot capacity must be > 0".into()));
        }
        if self.wfi_max_sleep == Some(Duration::ZERO) {
            return Err(Error::InvalidConfig("wfi_max_sleep must be non-zero".into()));
        }
        Ok(())
    }
}
