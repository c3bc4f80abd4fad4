//! AArch64 register model.
//!
//! [`RegisterFile`] is the host-side shadow of a vCPU's architectural
//! state. Synchronization with the backend is table driven: pull and push
//! both walk [`synced_registers`] so the two directions cannot drift apart.

/// Number of general-purpose registers (X0-X30).
pub const GP_COUNT: usize = 31;

/// Number of SIMD/FP registers (Q0-Q31).
pub const SIMD_COUNT: usize = 32;

/// A system register named by its MRS/MSR encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SysReg {
    pub op0: u8,
    pub op1: u8,
    pub crn: u8,
    pub crm: u8,
    pub op2: u8,
}

impl SysReg {
    pub const fn new(op0: u8, op1: u8, crn: u8, crm: u8, op2: u8) -> Self {
        Self {
            op0,
            op1,
            crn,
            crm,
            op2,
        }
    }

    /// Packed 16-bit encoding, as used by Hypervisor.framework's
    /// `hv_sys_reg_t`.
    pub const fn encoding(self) -> u16 {
        ((self.op0 as u16) << 14)
            | ((self.op1 as u16) << 11)
            | ((self.crn as u16) << 7)
            | ((self.crm as u16) << 3)
            | self.op2 as u16
    }

    /// Decode the register named by a trapped MSR/MRS syndrome.
    pub const fn from_iss(iss: u32) -> Self {
        Self {
            op0: ((iss >> 20) & 0x3) as u8,
            op2: ((iss >> 17) & 0x7) as u8,
            op1: ((iss >> 14) & 0x7) as u8,
            crn: ((iss >> 10) & 0xf) as u8,
            crm: ((iss >> 1) & 0xf) as u8,
        }
    }
}

impl std::fmt::Display for SysReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "S{}_{}_C{}_C{}_{}",
            self.op0, self.op1, self.crn, self.crm, self.op2
        )
    }
}

/// Well-known system registers.
pub mod sys {
    use super::SysReg;

    pub const SP_EL0: SysReg = SysReg::new(3, 0, 4, 1, 0);
    pub const SP_EL1: SysReg = SysReg::new(3, 4, 4, 1, 0);
    pub const ELR_EL1: SysReg = SysReg::new(3, 0, 4, 0, 1);
    pub const SPSR_EL1: SysReg = SysReg::new(3, 0, 4, 0, 0);

    pub const SCTLR_EL1: SysReg = SysReg::new(3, 0, 1, 0, 0);
    pub const CPACR_EL1: SysReg = SysReg::new(3, 0, 1, 0, 2);
    pub const TTBR0_EL1: SysReg = SysReg::new(3, 0, 2, 0, 0);
    pub const TTBR1_EL1: SysReg = SysReg::new(3, 0, 2, 0, 1);
    pub const TCR_EL1: SysReg = SysReg::new(3, 0, 2, 0, 2);

    pub const APIAKEYLO_EL1: SysReg = SysReg::new(3, 0, 2, 1, 0);
    pub const APIAKEYHI_EL1: SysReg = SysReg::new(3, 0, 2, 1, 1);
    pub const APIBKEYLO_EL1: SysReg = SysReg::new(3, 0, 2, 1, 2);
    pub const APIBKEYHI_EL1: SysReg = SysReg::new(3, 0, 2, 1, 3);
    pub const APDAKEYLO_EL1: SysReg = SysReg::new(3, 0, 2, 2, 0);
    pub const APDAKEYHI_EL1: SysReg = SysReg::new(3, 0, 2, 2, 1);
    pub const APDBKEYLO_EL1: SysReg = SysReg::new(3, 0, 2, 2, 2);
    pub const APDBKEYHI_EL1: SysReg = SysReg::new(3, 0, 2, 2, 3);
    pub const APGAKEYLO_EL1: SysReg = SysReg::new(3, 0, 2, 3, 0);
    pub const APGAKEYHI_EL1: SysReg = SysReg::new(3, 0, 2, 3, 1);

    pub const AFSR0_EL1: SysReg = SysReg::new(3, 0, 5, 1, 0);
    pub const AFSR1_EL1: SysReg = SysReg::new(3, 0, 5, 1, 1);
    pub const ESR_EL1: SysReg = SysReg::new(3, 0, 5, 2, 0);
    pub const FAR_EL1: SysReg = SysReg::new(3, 0, 6, 0, 0);
    pub const PAR_EL1: SysReg = SysReg::new(3, 0, 7, 4, 0);
    pub const MAIR_EL1: SysReg = SysReg::new(3, 0, 10, 2, 0);
    pub const AMAIR_EL1: SysReg = SysReg::new(3, 0, 10, 3, 0);
    pub const VBAR_EL1: SysReg = SysReg::new(3, 0, 12, 0, 0);
    pub const CONTEXTIDR_EL1: SysReg = SysReg::new(3, 0, 13, 0, 1);
    pub const TPIDR_EL1: SysReg = SysReg::new(3, 0, 13, 0, 4);
    pub const TPIDR_EL0: SysReg = SysReg::new(3, 3, 13, 0, 2);
    pub const TPIDRRO_EL0: SysReg = SysReg::new(3, 3, 13, 0, 3);
    pub const CSSELR_EL1: SysReg = SysReg::new(3, 2, 0, 0, 0);
    pub const MDSCR_EL1: SysReg = SysReg::new(2, 0, 0, 2, 2);

    pub const CNTKCTL_EL1: SysReg = SysReg::new(3, 0, 14, 1, 0);
    pub const CNTPCT_EL0: SysReg = SysReg::new(3, 3, 14, 0, 1);
    pub const CNTV_CTL_EL0: SysReg = SysReg::new(3, 3, 14, 3, 1);
    pub const CNTV_CVAL_EL0: SysReg = SysReg::new(3, 3, 14, 3, 2);

    // OS lock and debug registers; emulated as RAZ/WI.
    pub const OSLAR_EL1: SysReg = SysReg::new(2, 0, 1, 0, 4);
    pub const OSLSR_EL1: SysReg = SysReg::new(2, 0, 1, 1, 4);
    pub const OSDLR_EL1: SysReg = SysReg::new(2, 0, 1, 3, 4);
}

/// System registers mirrored between the shadow file and the backend.
pub const SYNCED_SYS_REGS: [SysReg; 36] = [
    sys::SP_EL0,
    sys::SP_EL1,
    sys::ELR_EL1,
    sys::SPSR_EL1,
    sys::APDAKEYHI_EL1,
    sys::APDAKEYLO_EL1,
    sys::APDBKEYHI_EL1,
    sys::APDBKEYLO_EL1,
    sys::APGAKEYHI_EL1,
    sys::APGAKEYLO_EL1,
    sys::APIAKEYHI_EL1,
    sys::APIAKEYLO_EL1,
    sys::APIBKEYHI_EL1,
    sys::APIBKEYLO_EL1,
    sys::CNTKCTL_EL1,
    sys::CONTEXTIDR_EL1,
    sys::CPACR_EL1,
    sys::CSSELR_EL1,
    sys::ESR_EL1,
    sys::FAR_EL1,
    sys::MAIR_EL1,
    sys::MDSCR_EL1,
    sys::PAR_EL1,
    sys::SCTLR_EL1,
    sys::TCR_EL1,
    sys::TPIDRRO_EL0,
    sys::TPIDR_EL0,
    sys::TPIDR_EL1,
    sys::TTBR0_EL1,
    sys::TTBR1_EL1,
    sys::VBAR_EL1,
    sys::AFSR0_EL1,
    sys::AFSR1_EL1,
    sys::AMAIR_EL1,
    sys::CNTV_CTL_EL0,
    sys::CNTV_CVAL_EL0,
];

/// A 64-bit architectural register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchReg {
    /// X0-X30.
    X(u8),
    Pc,
    Cpsr,
    Fpcr,
    Fpsr,
    Sys(SysReg),
}

/// Every 64-bit register exchanged on pull and push, in transfer order.
pub fn synced_registers() -> impl Iterator<Item = ArchReg> {
    (0..GP_COUNT as u8)
        .map(ArchReg::X)
        .chain([ArchReg::Pc, ArchReg::Cpsr, ArchReg::Fpcr, ArchReg::Fpsr])
        .chain(SYNCED_SYS_REGS.iter().copied().map(ArchReg::Sys))
}

/// PSTATE for EL1h with D, A, I and F masked.
pub const CPSR_EL1H_MASKED: u64 = 0x3c5;

/// Host-side copy of a vCPU's architectural state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterFile {
    pub x: [u64; GP_COUNT],
    pub pc: u64,
    pub cpsr: u64,
    pub fpcr: u64,
    pub fpsr: u64,
    pub q: [u128; SIMD_COUNT],
    sys: [u64; SYNCED_SYS_REGS.len()],
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self {
            x: [0; GP_COUNT],
            pc: 0,
            cpsr: 0,
            fpcr: 0,
            fpsr: 0,
            q: [0; SIMD_COUNT],
            sys: [0; SYNCED_SYS_REGS.len()],
        }
    }
}

impl RegisterFile {
    /// Architectural reset state: EL1h, all exceptions masked.
    pub fn reset_state() -> Self {
        Self {
            cpsr: CPSR_EL1H_MASKED,
            ..Default::default()
        }
    }

    /// Read a general-purpose register; index 31 reads as zero (XZR).
    pub fn gp(&self, n: u8) -> u64 {
        self.x.get(n as usize).copied().unwrap_or(0)
    }

    /// Write a general-purpose register; writes to index 31 are discarded.
    pub fn set_gp(&mut self, n: u8, value: u64) {
        if let Some(slot) = self.x.get_mut(n as usize) {
            *slot = value;
        }
    }

    /// Value of a mirrored system register, or `None` if it is not
    /// part of the synchronized set.
    pub fn sys(&self, reg: SysReg) -> Option<u64> {
        sys_index(reg).map(|i| self.sys[i])
    }

    /// Set a mirrored system register. Returns false if it is not part of
    /// the synchronized set.
    pub fn set_sys(&mut self, reg: SysReg, value: u64) -> bool {
        match sys_index(reg) {
            Some(i) => {
                self.sys[i] = value;
                true
            }
            None => false,
        }
    }

    /// Read any register in the synchronized set.
    pub fn get(&self, reg: ArchReg) -> u64 {
        match reg {
            ArchReg::X(n) => self.gp(n),
            ArchReg::Pc => self.pc,
            ArchReg::Cpsr => self.cpsr,
            ArchReg::Fpcr => self.fpcr,
            ArchReg::Fpsr => self.fpsr,
            ArchReg::Sys(r) => self.sys(r).unwrap_or(0),
        }
    }

    /// Write any register in the synchronized set.
    pub fn set(&mut self, reg: ArchReg, value: u64) {
        match reg {
            ArchReg::X(n) => self.set_gp(n, value),
            ArchReg::Pc => self.pc = value,
            ArchReg::Cpsr => self.cpsr = value,
            ArchReg::Fpcr => self.fpcr = value,
            ArchReg::Fpsr => self.fpsr = value,
            ArchReg::Sys(r) => {
                self.set_sys(r, value);
            }
        }
    }

    /// Step past the trapping instruction.
    pub fn advance_pc(&mut self, len: u64) {
        self.pc = self.pc.wrapping_add(len);
    }
}

fn sys_index(reg: SysReg) -> Option<usize> {
    SYNCED_SYS_REGS.iter().position(|r| *r == reg)
}
