//! Virtual CPU execution.
//!
//! Each vCPU keeps a shadow of its architectural registers and runs a loop
//! that resumes the guest, decodes why it exited, and emulates what the
//! hypervisor left to the host.

mod exit;
pub mod regs;
mod run;
mod state;
mod sysreg;
pub mod timer;

pub use exit::{class, DataAbort, ExitKind, SysRegAccess, Syndrome};
pub use regs::{ArchReg, RegisterFile, SysReg};
pub use run::{Vcpu, VcpuHandle, VcpuRunState};
pub use state::VcpuState;
