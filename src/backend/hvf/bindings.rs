//! Raw FFI bindings to Hypervisor.framework (Apple silicon).
//!
//! Prefer the safe wrapper in the parent module.
//!
//! ## References
//!
//! - https://developer.apple.com/documentation/hypervisor

#![allow(non_camel_case_types)]
#![allow(dead_code)]

use std::ffi::c_void;

// Link against Hypervisor.framework
#[link(name = "Hypervisor", kind = "framework")]
extern "C" {
    // VM management
    pub fn hv_vm_create(config: hv_vm_config_t) -> hv_return_t;
    pub fn hv_vm_destroy() -> hv_return_t;
    pub fn hv_vm_map(
        addr: *mut c_void,
        ipa: hv_ipa_t,
        size: usize,
        flags: hv_memory_flags_t,
    ) -> hv_return_t;
    pub fn hv_vm_unmap(ipa: hv_ipa_t, size: usize) -> hv_return_t;
    pub fn hv_vm_protect(ipa: hv_ipa_t, size: usize, flags: hv_memory_flags_t) -> hv_return_t;

    // vCPU management
    pub fn hv_vcpu_create(
        vcpu: *mut hv_vcpu_t,
        exit: *mut *const hv_vcpu_exit_t,
        config: hv_vcpu_config_t,
    ) -> hv_return_t;
    pub fn hv_vcpu_destroy(vcpu: hv_vcpu_t) -> hv_return_t;
    pub fn hv_vcpu_run(vcpu: hv_vcpu_t) -> hv_return_t;
    pub fn hv_vcpus_exit(vcpus: *const hv_vcpu_t, count: u32) -> hv_return_t;

    // Registers
    pub fn hv_vcpu_get_reg(vcpu: hv_vcpu_t, reg: hv_reg_t, value: *mut u64) -> hv_return_t;
    pub fn hv_vcpu_set_reg(vcpu: hv_vcpu_t, reg: hv_reg_t, value: u64) -> hv_return_t;
    pub fn hv_vcpu_get_sys_reg(vcpu: hv_vcpu_t, reg: hv_sys_reg_t, value: *mut u64)
        -> hv_return_t;
    pub fn hv_vcpu_set_sys_reg(vcpu: hv_vcpu_t, reg: hv_sys_reg_t, value: u64) -> hv_return_t;
    // The value is a 16-byte NEON vector; u128 has the same size, alignment
    // and little-endian lane order.
    pub fn hv_vcpu_get_simd_fp_reg(
        vcpu: hv_vcpu_t,
        reg: hv_simd_fp_reg_t,
        value: *mut u128,
    ) -> hv_return_t;
    // Takes the vector by value in q0, which stable Rust cannot declare.
    // Called through `set_simd_fp_reg`.
    fn hv_vcpu_set_simd_fp_reg();

    // Interrupts and timer
    pub fn hv_vcpu_set_pending_interrupt(
        vcpu: hv_vcpu_t,
        interrupt_type: hv_interrupt_type_t,
        pending: bool,
    ) -> hv_return_t;
    pub fn hv_vcpu_set_vtimer_mask(vcpu: hv_vcpu_t, vtimer_is_masked: bool) -> hv_return_t;
    pub fn hv_vcpu_get_vtimer_offset(vcpu: hv_vcpu_t, vtimer_offset: *mut u64) -> hv_return_t;
}

/// Call `hv_vcpu_set_simd_fp_reg(vcpu, reg, value)` with `value` in q0.
///
/// # Safety
///
/// `vcpu` must be a live vCPU owned by the calling thread.
pub unsafe fn set_simd_fp_reg(vcpu: hv_vcpu_t, reg: hv_simd_fp_reg_t, value: u128) -> hv_return_t {
    let bytes = value.to_le_bytes();
    let ret: u64;
    std::arch::asm!(
        "ldr q0, [{src}]",
        "blr {func}",
        src = in(reg) bytes.as_ptr(),
        func = in(reg) hv_vcpu_set_simd_fp_reg as usize,
        inout("x0") vcpu => ret,
        in("x1") u64::from(reg),
        clobber_abi("C"),
    );
    ret as hv_return_t
}

// Basic types
pub type hv_return_t = i32;
pub type hv_ipa_t = u64;
pub type hv_memory_flags_t = u64;
pub type hv_vm_config_t = *mut c_void;
pub type hv_vcpu_t = u64;
pub type hv_vcpu_config_t = *mut c_void;
pub type hv_reg_t = u32;
pub type hv_sys_reg_t = u16;
pub type hv_simd_fp_reg_t = u32;
pub type hv_interrupt_type_t = u32;
pub type hv_exit_reason_t = u32;

/// Exit information, written by `hv_vcpu_run` into per-vCPU storage.
#[repr(C)]
pub struct hv_vcpu_exit_t {
    pub reason: hv_exit_reason_t,
    pub exception: hv_vcpu_exit_exception_t,
}

#[repr(C)]
pub struct hv_vcpu_exit_exception_t {
    pub syndrome: u64,
    pub virtual_address: u64,
    pub physical_address: u64,
}

// Return codes
pub const HV_SUCCESS: hv_return_t = 0;
pub const HV_ERROR: hv_return_t = 0xfae94001_u32 as i32;
pub const HV_BUSY: hv_return_t = 0xfae94002_u32 as i32;
pub const HV_BAD_ARGUMENT: hv_return_t = 0xfae94003_u32 as i32;
pub const HV_NO_RESOURCES: hv_return_t = 0xfae94005_u32 as i32;
pub const HV_NO_DEVICE: hv_return_t = 0xfae94006_u32 as i32;
pub const HV_DENIED: hv_return_t = 0xfae94007_u32 as i32;
pub const HV_UNSUPPORTED: hv_return_t = 0xfae9400f_u32 as i32;

// Memory flags
pub const HV_MEMORY_READ: hv_memory_flags_t = 1 << 0;
pub const HV_MEMORY_WRITE: hv_memory_flags_t = 1 << 1;
pub const HV_MEMORY_EXEC: hv_memory_flags_t = 1 << 2;

// General registers. X0-X30 are 0-30.
pub const HV_REG_PC: hv_reg_t = 31;
pub const HV_REG_FPCR: hv_reg_t = 32;
pub const HV_REG_FPSR: hv_reg_t = 33;
pub const HV_REG_CPSR: hv_reg_t = 34;

// Exit reasons
pub const HV_EXIT_REASON_CANCELED: hv_exit_reason_t = 0;
pub const HV_EXIT_REASON_EXCEPTION: hv_exit_reason_t = 1;
pub const HV_EXIT_REASON_VTIMER_ACTIVATED: hv_exit_reason_t = 2;
pub const HV_EXIT_REASON_UNKNOWN: hv_exit_reason_t = 3;

// Interrupt types
pub const HV_INTERRUPT_TYPE_IRQ: hv_interrupt_type_t = 0;
pub const HV_INTERRUPT_TYPE_FIQ: hv_interrupt_type_t = 1;

/// Convert HVF return code to a human-readable string.
pub fn hv_return_string(code: hv_return_t) -> &'static str {
    match code {
        HV_SUCCESS => "Success",
        HV_ERROR => "Error",
        HV_BUSY => "Busy",
        HV_BAD_ARGUMENT => "Bad argument",
        HV_NO_RESOURCES => "No resources",
        HV_NO_DEVICE => "No device",
        HV_DENIED => "Denied (missing entitlement?)",
        HV_UNSUPPORTED => "Unsupported",
        _ => "Unknown error",
    }
}

/// Convert an HVF return code from `op` to a Result.
pub fn hv_result(op: &'static str, code: hv_return_t) -> crate::error::Result<()> {
    if code == HV_SUCCESS {
        Ok(())
    } else {
        tracing::debug!(op, code = format_args!("{:#x}", code), "{}", hv_return_string(code));
        Err(crate::error::Error::backend(op, code))
    }
}
