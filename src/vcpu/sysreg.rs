//! Emulation of trapped system register accesses.

use crate::device::DeviceBus;

use super::exit::SysRegAccess;
use super::regs::{sys, RegisterFile};

/// Apply one trapped MSR/MRS to `regs`.
///
/// The device bus gets the first chance at every access. Counter reads are
/// answered from `counter`; the OS lock registers read as zero and ignore
/// writes. Any other register reads as zero and ignores writes, with a
/// warning.
pub fn emulate(
    access: SysRegAccess,
    regs: &mut RegisterFile,
    bus: &dyn DeviceBus,
    vcpu: u32,
    counter: u64,
) {
    if access.read {
        let value = bus.sysreg_read(vcpu, access.reg).unwrap_or_else(|| match access.reg {
            sys::CNTPCT_EL0 => counter,
            sys::OSLSR_EL1 | sys::OSDLR_EL1 | sys::OSLAR_EL1 => 0,
            reg => {
                tracing::warn!(vcpu, %reg, "unhandled system register read");
                0
            }
        });
        regs.set_gp(access.rt, value);
    } else {
        let value = regs.gp(access.rt);
        if bus.sysreg_write(vcpu, access.reg, value) {
            return;
        }
        match access.reg {
            sys::OSLAR_EL1 | sys::OSDLR_EL1 => {}
            reg => tracing::warn!(
                vcpu,
                %reg,
                value = format_args!("{:#x}", value),
                "unhandled system register write"
            ),
        }
    }
}
