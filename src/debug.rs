//! Logging setup for hvaccel.
//!
//! The library only emits `tracing` events; embedders normally install their
//! own subscriber. [`init_tracing`] is a convenience for tools and tests that
//! want stderr output filtered by `HVACCEL_LOG`, for example:
//!
//! - `HVACCEL_LOG=debug` - slot table updates and vCPU lifecycle
//! - `HVACCEL_LOG=hvaccel::memory=trace` - every backend map and unmap
//! - `HVACCEL_LOG=hvaccel::vcpu=trace` - every exit and emulated access

use std::io::IsTerminal;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Environment variable holding the filter directives.
pub const LOG_ENV: &str = "HVACCEL_LOG";

/// Build the filter from `HVACCEL_LOG`, defaulting to `info`.
pub fn env_filter() -> Result<EnvFilter> {
    match std::env::var(LOG_ENV) {
        Ok(directives) => EnvFilter::try_new(&directives)
            .map_err(|e| Error::InvalidConfig(format!("invalid {LOG_ENV}: {e}"))),
        Err(_) => Ok(EnvFilter::default().add_directive(LevelFilter::INFO.into())),
    }
}

/// Install a stderr subscriber filtered by `HVACCEL_LOG`.
///
/// Fails if the filter does not parse or a global subscriber is already set.
pub fn init_tracing() -> Result<()> {
    let filter = env_filter()?;
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(std::io::stderr().is_terminal())
        .with_thread_names(true)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .try_init()
        .map_err(|e| Error::InvalidConfig(format!("failed to enable tracing: {e}")))
}
