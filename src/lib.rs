//! # hvaccel
//!
//! Hardware-virtualization acceleration core for an AArch64 machine
//! emulator.
//!
//! The crate keeps the platform hypervisor's view of guest physical memory
//! consistent with the emulator's memory map, and drives vCPUs through the
//! hypervisor: resuming them, decoding their exits, and emulating what the
//! hypervisor leaves to the host.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hvaccel::backend::recording::RecordingBackend;
//! use hvaccel::{Accelerator, MemFlags, MmioBus, RamBlock, RegisterFile, Result};
//!
//! fn main() -> Result<()> {
//!     hvaccel::debug::init_tracing()?;
//!     let accel = Accelerator::builder(RecordingBackend::new()).build()?;
//!
//!     let ram = RamBlock::new(128 << 20)?;
//!     accel.add_region(ram.region(0x4000_0000, MemFlags::RWX))?;
//!
//!     let mut boot = RegisterFile::reset_state();
//!     boot.pc = 0x4008_0000;
//!     let vcpu = accel.spawn_vcpu(0, Arc::new(MmioBus::new()), boot)?;
//!     vcpu.handle().set_irq_level(true)?;
//!     vcpu.stop()
//! }
//! ```
//!
//! ## Platform Support
//!
//! - **macOS (Apple Silicon)**: Hypervisor.framework, memory and vCPUs
//! - **Windows**: Windows Hypervisor Platform, guest memory mapping only

mod accel;
mod builder;
pub mod config;
pub mod debug;
mod error;

pub mod backend;
pub mod device;
pub mod memory;
pub mod vcpu;

// Re-exports
pub use accel::{Accelerator, VcpuThread};
pub use backend::{
    ExitReason, ExitRecord, GuestMemoryMapper, HostAddress, HypervisorBackend, InterruptKind,
    MemFlags, SlotId,
};
pub use builder::AccelBuilder;
pub use config::{AccelConfig, OverlapPolicy};
pub use device::{DeviceBus, MmioBus, MmioDevice};
pub use error::{fatal, Error, Result};
pub use memory::{MemoryRegion, MemorySlotTable, RamBlock, Slot};
pub use vcpu::{RegisterFile, Vcpu, VcpuHandle, VcpuRunState};

/// Check if the current platform supports hardware virtualization.
///
/// Returns `true` if the hypervisor is available and can be used.
pub fn is_supported() -> bool {
    backend::is_available()
}

/// Get the name of the hypervisor backend for the current platform.
///
/// Returns `None` if no backend is available.
pub fn backend_name() -> Option<&'static str> {
    backend::name()
}
