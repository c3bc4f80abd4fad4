//! Hypervisor backend abstraction.
//!
//! This module defines the capability traits that platform backends
//! implement, and the small value types that cross that boundary.

use std::fmt;

use bitflags::bitflags;

use crate::config::OverlapPolicy;
use crate::error::Result;
use crate::vcpu::regs::ArchReg;

// Platform-specific backend modules
#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
pub mod hvf;

#[cfg(target_os = "windows")]
pub mod whp;

pub mod recording;

bitflags! {
    /// Guest access permissions for a mapped range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const RW = Self::READ.bits() | Self::WRITE.bits();
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

/// Stable identity of a slot; backends address mappings by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot{}", self.0)
    }
}

/// A host virtual address backing guest memory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct HostAddress(pub usize);

impl HostAddress {
    /// Wrap a host pointer.
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// The address `delta` bytes past this one.
    pub fn offset(self, delta: u64) -> Self {
        Self(self.0.wrapping_add(delta as usize))
    }

    /// Raw pointer view.
    pub fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }

    /// Raw address value.
    pub fn value(self) -> u64 {
        self.0 as u64
    }
}

impl fmt::Debug for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Opaque identifier the backend uses to force a vCPU out of guest mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VcpuId(pub u64);

/// Interrupt lines a vCPU exposes to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterruptKind {
    Irq,
    Fiq,
}

/// Why the backend returned from guest execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Another thread asked the vCPU to leave guest mode.
    Canceled,
    /// The guest took an exception to the hypervisor.
    Exception,
    /// The guest's virtual timer fired; the backend has masked it.
    VtimerActivated,
    /// Anything the backend could not classify.
    Unknown(u32),
}

/// Exception details reported with [`ExitReason::Exception`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExceptionInfo {
    /// ESR_EL2-format syndrome.
    pub syndrome: u64,
    pub virtual_address: u64,
    pub physical_address: u64,
}

/// One decoded exit from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRecord {
    pub reason: ExitReason,
    pub exception: Option<ExceptionInfo>,
}

impl ExitRecord {
    /// A cancellation exit.
    pub fn canceled() -> Self {
        Self {
            reason: ExitReason::Canceled,
            exception: None,
        }
    }

    /// A virtual timer exit.
    pub fn vtimer() -> Self {
        Self {
            reason: ExitReason::VtimerActivated,
            exception: None,
        }
    }

    /// An exception exit.
    pub fn exception(syndrome: u64, virtual_address: u64, physical_address: u64) -> Self {
        Self {
            reason: ExitReason::Exception,
            exception: Some(ExceptionInfo {
                syndrome,
                virtual_address,
                physical_address,
            }),
        }
    }
}

/// Guest-physical memory mapping capability.
///
/// Implementations must be callable from any thread; the slot table
/// serializes all calls under its own lock.
pub trait GuestMemoryMapper: Send + Sync {
    /// Map `size` bytes at `host` to guest-physical `gpa`.
    fn map(
        &self,
        slot: SlotId,
        host: HostAddress,
        gpa: u64,
        size: u64,
        flags: MemFlags,
    ) -> Result<()>;

    /// Remove the mapping of `[gpa, gpa + size)`.
    fn unmap(&self, slot: SlotId, gpa: u64, size: u64) -> Result<()>;

    /// Change the permissions of an already-mapped range.
    fn protect(&self, gpa: u64, size: u64, flags: MemFlags) -> Result<()>;

    /// The overlap policy this backend can support.
    fn preferred_policy(&self) -> OverlapPolicy {
        OverlapPolicy::Splitting
    }
}

/// The full capability set over a platform hypervisor.
///
/// vCPU handles are owned by one thread. Every method taking a vCPU is
/// called only from that thread, except [`force_exit`](Self::force_exit).
pub trait HypervisorBackend: GuestMemoryMapper {
    /// Backend-resident vCPU handle.
    type Vcpu: Send;

    /// Create a vCPU on the calling thread.
    fn create_vcpu(&self, index: u32) -> Result<Self::Vcpu>;

    /// Destroy a vCPU. Called on its owning thread.
    fn destroy_vcpu(&self, vcpu: Self::Vcpu) -> Result<()>;

    /// Identity used by [`force_exit`](Self::force_exit).
    fn vcpu_id(&self, vcpu: &Self::Vcpu) -> VcpuId;

    /// Read one 64-bit architectural register.
    fn get_register(&self, vcpu: &Self::Vcpu, reg: ArchReg) -> Result<u64>;

    /// Write one 64-bit architectural register.
    fn set_register(&self, vcpu: &Self::Vcpu, reg: ArchReg, value: u64) -> Result<()>;

    /// Read SIMD/FP register `Q<index>`.
    fn get_simd(&self, vcpu: &Self::Vcpu, index: u8) -> Result<u128>;

    /// Write SIMD/FP register `Q<index>`.
    fn set_simd(&self, vcpu: &Self::Vcpu, index: u8, value: u128) -> Result<()>;

    /// Set the level presented on an interrupt line for the next resume.
    fn set_pending_interrupt(&self, vcpu: &Self::Vcpu, kind: InterruptKind, pending: bool)
        -> Result<()>;

    /// Mask or unmask virtual timer exits.
    fn set_vtimer_mask(&self, vcpu: &Self::Vcpu, masked: bool) -> Result<()>;

    /// Current value of the guest's virtual counter (CNTVCT_EL0).
    fn virtual_counter(&self, vcpu: &Self::Vcpu) -> Result<u64>;

    /// Frequency of the virtual counter in Hz.
    fn counter_frequency(&self) -> u64;

    /// Resume the guest until it exits. May block indefinitely.
    fn run(&self, vcpu: &mut Self::Vcpu) -> Result<ExitRecord>;

    /// Force a running vCPU to exit with [`ExitReason::Canceled`]. Callable
    /// from any thread; a request made while the vCPU is outside guest mode
    /// cancels its next resume.
    fn force_exit(&self, id: VcpuId) -> Result<()>;

    /// Backend name (e.g., "hvf", "recording").
    fn name(&self) -> &'static str;
}

/// Check if a hardware hypervisor is available on this platform.
pub fn is_available() -> bool {
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    {
        hvf::is_available()
    }

    #[cfg(target_os = "windows")]
    {
        whp::is_available()
    }

    #[cfg(not(any(all(target_os = "macos", target_arch = "aarch64"), target_os = "windows")))]
    {
        false
    }
}

/// Get the name of the hardware backend for this platform.
pub fn name() -> Option<&'static str> {
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    {
        Some("hvf")
    }

    #[cfg(target_os = "windows")]
    {
        Some("whp")
    }

    #[cfg(not(any(all(target_os = "macos", target_arch = "aarch64"), target_os = "windows")))]
    {
        None
    }
}
