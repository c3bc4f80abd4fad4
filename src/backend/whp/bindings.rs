//! Windows Hypervisor Platform helpers over windows-rs.
//!
//! ## References
//!
//! - https://docs.microsoft.com/en-us/virtualization/api/hypervisor-platform/

use windows::Win32::System::Hypervisor::*;

use crate::backend::MemFlags;
use crate::error::Error;

/// Check if the hypervisor is present and WHP is usable.
pub fn check_whp_available() -> bool {
    unsafe {
        let mut capability = WHV_CAPABILITY::default();
        let result = WHvGetCapability(
            WHvCapabilityCodeHypervisorPresent,
            &mut capability as *mut _ as *mut _,
            std::mem::size_of::<WHV_CAPABILITY>() as u32,
            None,
        );

        if result.is_ok() {
            capability.HypervisorPresent.as_bool()
        } else {
            false
        }
    }
}

/// Translate a windows-rs error from `op`.
pub fn whp_error(op: &'static str, err: windows::core::Error) -> Error {
    tracing::debug!(op, "WHP error: 0x{:08X} {}", err.code().0, err.message());
    Error::backend(op, err.code().0)
}

/// Convert guest permissions to WHP mapping flags.
pub fn map_flags(flags: MemFlags) -> WHV_MAP_GPA_RANGE_FLAGS {
    let mut bits = WHvMapGpaRangeFlagNone.0;
    if flags.contains(MemFlags::READ) {
        bits |= WHvMapGpaRangeFlagRead.0;
    }
    if flags.contains(MemFlags::WRITE) {
        bits |= WHvMapGpaRangeFlagWrite.0;
    }
    if flags.contains(MemFlags::EXEC) {
        bits |= WHvMapGpaRangeFlagExecute.0;
    }
    WHV_MAP_GPA_RANGE_FLAGS(bits)
}
