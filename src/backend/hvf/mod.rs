//! macOS Hypervisor.framework backend (Apple silicon).
//!
//! ## Requirements
//!
//! - macOS 11+ on Apple silicon
//! - `com.apple.security.hypervisor` entitlement
//!
//! Hypervisor.framework holds one VM per process, so at most one
//! [`HvfBackend`] can exist at a time. Mappings cannot be split in place;
//! the backend prefers [`OverlapPolicy::Strict`].

pub mod bindings;

use self::bindings::{hv_result, hv_vcpu_exit_t, hv_vcpu_t};
use crate::backend::{
    ExitReason, ExitRecord, GuestMemoryMapper, HostAddress, HypervisorBackend, InterruptKind,
    MemFlags, SlotId, VcpuId,
};
use crate::config::OverlapPolicy;
use crate::error::{Error, Result};
use crate::vcpu::regs::ArchReg;

/// Check if Hypervisor.framework is available.
pub fn is_available() -> bool {
    // Creating and destroying a VM is the only reliable probe; it also fails
    // without the entitlement.
    unsafe {
        let result = bindings::hv_vm_create(std::ptr::null_mut());
        if result == bindings::HV_SUCCESS {
            bindings::hv_vm_destroy();
            true
        } else {
            false
        }
    }
}

fn memory_flags(flags: MemFlags) -> bindings::hv_memory_flags_t {
    let mut out = 0;
    if flags.contains(MemFlags::READ) {
        out |= bindings::HV_MEMORY_READ;
    }
    if flags.contains(MemFlags::WRITE) {
        out |= bindings::HV_MEMORY_WRITE;
    }
    if flags.contains(MemFlags::EXEC) {
        out |= bindings::HV_MEMORY_EXEC;
    }
    out
}

fn interrupt_type(kind: InterruptKind) -> bindings::hv_interrupt_type_t {
    match kind {
        InterruptKind::Irq => bindings::HV_INTERRUPT_TYPE_IRQ,
        InterruptKind::Fiq => bindings::HV_INTERRUPT_TYPE_FIQ,
    }
}

/// Read the architectural counter frequency of the host.
fn host_counter_frequency() -> u64 {
    let freq: u64;
    // CNTFRQ_EL0 is readable from EL0 on macOS.
    unsafe {
        std::arch::asm!("mrs {}, cntfrq_el0", out(reg) freq, options(nomem, nostack));
    }
    freq
}

/// The process-wide Hypervisor.framework VM.
pub struct HvfBackend {
    counter_frequency: u64,
}

impl HvfBackend {
    /// Create the VM.
    pub fn new() -> Result<Self> {
        let ret = unsafe { bindings::hv_vm_create(std::ptr::null_mut()) };
        match ret {
            bindings::HV_SUCCESS => {}
            bindings::HV_DENIED | bindings::HV_UNSUPPORTED => {
                tracing::warn!("Hypervisor.framework: {}", bindings::hv_return_string(ret));
                return Err(Error::HypervisorNotAvailable);
            }
            _ => hv_result("hv_vm_create", ret)?,
        }

        let counter_frequency = host_counter_frequency();
        tracing::info!(counter_frequency, "HVF VM created");
        Ok(Self { counter_frequency })
    }
}

impl Drop for HvfBackend {
    fn drop(&mut self) {
        let ret = unsafe { bindings::hv_vm_destroy() };
        if ret != bindings::HV_SUCCESS {
            tracing::warn!("hv_vm_destroy: {}", bindings::hv_return_string(ret));
        }
    }
}

impl GuestMemoryMapper for HvfBackend {
    fn map(
        &self,
        slot: SlotId,
        host: HostAddress,
        gpa: u64,
        size: u64,
        flags: MemFlags,
    ) -> Result<()> {
        tracing::trace!(%slot, ?host, gpa = format_args!("{gpa:#x}"), size, "hv_vm_map");
        let ret = unsafe {
            bindings::hv_vm_map(
                host.as_ptr().cast(),
                gpa,
                size as usize,
                memory_flags(flags),
            )
        };
        hv_result("hv_vm_map", ret)
    }

    fn unmap(&self, slot: SlotId, gpa: u64, size: u64) -> Result<()> {
        tracing::trace!(%slot, gpa = format_args!("{gpa:#x}"), size, "hv_vm_unmap");
        let ret = unsafe { bindings::hv_vm_unmap(gpa, size as usize) };
        hv_result("hv_vm_unmap", ret)
    }

    fn protect(&self, gpa: u64, size: u64, flags: MemFlags) -> Result<()> {
        let ret = unsafe { bindings::hv_vm_protect(gpa, size as usize, memory_flags(flags)) };
        hv_result("hv_vm_protect", ret)
    }

    fn preferred_policy(&self) -> OverlapPolicy {
        OverlapPolicy::Strict
    }
}

/// An HVF vCPU handle and its exit record.
pub struct HvfVcpu {
    handle: hv_vcpu_t,
    exit: *const hv_vcpu_exit_t,
}

// Safety: HVF binds a vCPU to its creating thread and the run loop only calls
// in from there; hv_vcpus_exit takes the id, not this struct. The exit record
// is owned by the framework and valid until hv_vcpu_destroy.
unsafe impl Send for HvfVcpu {}

impl HypervisorBackend for HvfBackend {
    type Vcpu = HvfVcpu;

    fn create_vcpu(&self, index: u32) -> Result<HvfVcpu> {
        let mut handle: hv_vcpu_t = 0;
        let mut exit: *const hv_vcpu_exit_t = std::ptr::null();
        // A null config selects the default vCPU configuration.
        let ret = unsafe { bindings::hv_vcpu_create(&mut handle, &mut exit, std::ptr::null_mut()) };
        hv_result("hv_vcpu_create", ret)?;
        if exit.is_null() {
            return Err(Error::backend("hv_vcpu_create", bindings::HV_ERROR));
        }
        tracing::debug!(vcpu = index, handle, "HVF vCPU created");
        Ok(HvfVcpu { handle, exit })
    }

    fn destroy_vcpu(&self, vcpu: HvfVcpu) -> Result<()> {
        let ret = unsafe { bindings::hv_vcpu_destroy(vcpu.handle) };
        hv_result("hv_vcpu_destroy", ret)
    }

    fn vcpu_id(&self, vcpu: &HvfVcpu) -> VcpuId {
        VcpuId(vcpu.handle)
    }

    fn get_register(&self, vcpu: &HvfVcpu, reg: ArchReg) -> Result<u64> {
        let mut value = 0u64;
        let ret = unsafe {
            match reg {
                ArchReg::Sys(sys) => {
                    bindings::hv_vcpu_get_sys_reg(vcpu.handle, sys.encoding(), &mut value)
                }
                other => bindings::hv_vcpu_get_reg(vcpu.handle, general_reg(other), &mut value),
            }
        };
        hv_result("hv_vcpu_get_reg", ret)?;
        Ok(value)
    }

    fn set_register(&self, vcpu: &HvfVcpu, reg: ArchReg, value: u64) -> Result<()> {
        let ret = unsafe {
            match reg {
                ArchReg::Sys(sys) => bindings::hv_vcpu_set_sys_reg(vcpu.handle, sys.encoding(), value),
                other => bindings::hv_vcpu_set_reg(vcpu.handle, general_reg(other), value),
            }
        };
        hv_result("hv_vcpu_set_reg", ret)
    }

    fn get_simd(&self, vcpu: &HvfVcpu, index: u8) -> Result<u128> {
        let mut value = 0u128;
        let ret =
            unsafe { bindings::hv_vcpu_get_simd_fp_reg(vcpu.handle, u32::from(index), &mut value) };
        hv_result("hv_vcpu_get_simd_fp_reg", ret)?;
        Ok(value)
    }

    fn set_simd(&self, vcpu: &HvfVcpu, index: u8, value: u128) -> Result<()> {
        let ret = unsafe { bindings::set_simd_fp_reg(vcpu.handle, u32::from(index), value) };
        hv_result("hv_vcpu_set_simd_fp_reg", ret)
    }

    fn set_pending_interrupt(
        &self,
        vcpu: &HvfVcpu,
        kind: InterruptKind,
        pending: bool,
    ) -> Result<()> {
        let ret = unsafe {
            bindings::hv_vcpu_set_pending_interrupt(vcpu.handle, interrupt_type(kind), pending)
        };
        hv_result("hv_vcpu_set_pending_interrupt", ret)
    }

    fn set_vtimer_mask(&self, vcpu: &HvfVcpu, masked: bool) -> Result<()> {
        let ret = unsafe { bindings::hv_vcpu_set_vtimer_mask(vcpu.handle, masked) };
        hv_result("hv_vcpu_set_vtimer_mask", ret)
    }

    fn virtual_counter(&self, vcpu: &HvfVcpu) -> Result<u64> {
        let mut offset = 0u64;
        let ret = unsafe { bindings::hv_vcpu_get_vtimer_offset(vcpu.handle, &mut offset) };
        hv_result("hv_vcpu_get_vtimer_offset", ret)?;
        let now = unsafe { libc::mach_absolute_time() };
        Ok(now.wrapping_sub(offset))
    }

    fn counter_frequency(&self) -> u64 {
        self.counter_frequency
    }

    fn run(&self, vcpu: &mut HvfVcpu) -> Result<ExitRecord> {
        let ret = unsafe { bindings::hv_vcpu_run(vcpu.handle) };
        hv_result("hv_vcpu_run", ret)?;

        // Safety: valid until hv_vcpu_destroy, and only this thread runs the vCPU.
        let exit = unsafe { &*vcpu.exit };
        let record = match exit.reason {
            bindings::HV_EXIT_REASON_CANCELED => ExitRecord::canceled(),
            bindings::HV_EXIT_REASON_EXCEPTION => ExitRecord::exception(
                exit.exception.syndrome,
                exit.exception.virtual_address,
                exit.exception.physical_address,
            ),
            bindings::HV_EXIT_REASON_VTIMER_ACTIVATED => ExitRecord::vtimer(),
            other => ExitRecord {
                reason: ExitReason::Unknown(other),
                exception: None,
            },
        };
        Ok(record)
    }

    fn force_exit(&self, id: VcpuId) -> Result<()> {
        let handle: hv_vcpu_t = id.0;
        let ret = unsafe { bindings::hv_vcpus_exit(&handle, 1) };
        hv_result("hv_vcpus_exit", ret)
    }

    fn name(&self) -> &'static str {
        "hvf"
    }
}

/// Map a non-system register to its `hv_reg_t`.
fn general_reg(reg: ArchReg) -> bindings::hv_reg_t {
    match reg {
        ArchReg::X(n) => u32::from(n),
        ArchReg::Pc => bindings::HV_REG_PC,
        ArchReg::Fpcr => bindings::HV_REG_FPCR,
        ArchReg::Fpsr => bindings::HV_REG_FPSR,
        ArchReg::Cpsr => bindings::HV_REG_CPSR,
        // Routed to the sysreg calls by the callers.
        ArchReg::Sys(sys) => u32::from(sys.encoding()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcpu::regs::sys;

    #[test]
    fn test_memory_flags() {
        assert_eq!(memory_flags(MemFlags::READ), bindings::HV_MEMORY_READ);
        assert_eq!(
            memory_flags(MemFlags::RWX),
            bindings::HV_MEMORY_READ | bindings::HV_MEMORY_WRITE | bindings::HV_MEMORY_EXEC
        );
        assert_eq!(memory_flags(MemFlags::empty()), 0);
    }

    #[test]
    fn test_general_reg_numbers() {
        assert_eq!(general_reg(ArchReg::X(0)), 0);
        assert_eq!(general_reg(ArchReg::X(30)), 30);
        assert_eq!(general_reg(ArchReg::Pc), 31);
        assert_eq!(general_reg(ArchReg::Cpsr), 34);
    }

    #[test]
    fn test_sysreg_encodings_match_framework() {
        assert_eq!(sys::ELR_EL1.encoding(), 0xc201);
        assert_eq!(sys::SP_EL0.encoding(), 0xc208);
        assert_eq!(sys::MDSCR_EL1.encoding(), 0x8012);
        assert_eq!(sys::CNTV_CTL_EL0.encoding(), 0xdf19);
    }

    #[test]
    fn test_counter_frequency_nonzero() {
        assert!(host_counter_frequency() > 0);
    }
}
