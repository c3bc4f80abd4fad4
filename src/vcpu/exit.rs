//! Exception syndrome decoding.

use super::regs::SysReg;

/// Exception classes (ESR_ELx.EC) the run loop understands.
pub mod class {
    pub const WFX: u8 = 0x01;
    pub const HVC64: u8 = 0x16;
    pub const SMC64: u8 = 0x17;
    pub const SYS64: u8 = 0x18;
    pub const IABT_LOWER: u8 = 0x20;
    pub const DABT_LOWER: u8 = 0x24;
}

/// An ESR_ELx-format exception syndrome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Syndrome(pub u64);

impl Syndrome {
    /// Exception class.
    pub fn class(self) -> u8 {
        ((self.0 >> 26) & 0x3f) as u8
    }

    /// Instruction-specific syndrome.
    pub fn iss(self) -> u32 {
        (self.0 & 0x1ff_ffff) as u32
    }

    /// Length in bytes of the trapping instruction.
    pub fn instruction_len(self) -> u64 {
        if self.0 & (1 << 25) != 0 {
            4
        } else {
            2
        }
    }

    /// Build a syndrome from its parts. IL is always set.
    pub fn new(class: u8, iss: u32) -> Self {
        Self(((class as u64 & 0x3f) << 26) | (1 << 25) | (iss as u64 & 0x1ff_ffff))
    }
}

/// A decoded data abort ISS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataAbort {
    /// Instruction syndrome valid; the fields below are meaningful only if set.
    pub isv: bool,
    /// Access size as log2(bytes).
    pub sas: u8,
    /// Sign-extend the loaded value.
    pub sse: bool,
    /// Transfer register; 31 is XZR.
    pub srt: u8,
    /// 64-bit destination register.
    pub sf: bool,
    /// Abort on stage-1 translation table walk.
    pub s1ptw: bool,
    /// Write, not read.
    pub wnr: bool,
}

impl DataAbort {
    pub fn from_iss(iss: u32) -> Self {
        Self {
            isv: iss & (1 << 24) != 0,
            sas: ((iss >> 22) & 0x3) as u8,
            sse: iss & (1 << 21) != 0,
            srt: ((iss >> 16) & 0x1f) as u8,
            sf: iss & (1 << 15) != 0,
            s1ptw: iss & (1 << 7) != 0,
            wnr: iss & (1 << 6) != 0,
        }
    }

    /// Access width in bytes.
    pub fn width(&self) -> usize {
        1 << self.sas
    }

    /// Mask covering the access width.
    pub fn value_mask(&self) -> u64 {
        match self.width() {
            8 => u64::MAX,
            w => (1u64 << (w * 8)) - 1,
        }
    }

    /// Apply sign extension and register width to a loaded value.
    pub fn extend_load(&self, raw: u64) -> u64 {
        let mut value = raw & self.value_mask();
        if self.sse && self.width() < 8 {
            let shift = 64 - (self.width() as u32 * 8);
            value = (((value << shift) as i64) >> shift) as u64;
            if !self.sf {
                value &= 0xffff_ffff;
            }
        }
        value
    }
}

/// A decoded MSR/MRS trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysRegAccess {
    pub reg: SysReg,
    pub rt: u8,
    /// MRS (read into Rt) when set, MSR otherwise.
    pub read: bool,
}

impl SysRegAccess {
    pub fn from_iss(iss: u32) -> Self {
        Self {
            reg: SysReg::from_iss(iss),
            rt: ((iss >> 5) & 0x1f) as u8,
            read: iss & 1 != 0,
        }
    }
}

/// What the most recent exit was, as observed by the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Canceled,
    Exception,
    TimerActivated,
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcpu::regs::sys;

    #[test]
    fn test_syndrome_fields() {
        let syndrome = Syndrome::new(class::DABT_LOWER, 0x0123);
        assert_eq!(syndrome.class(), class::DABT_LOWER);
        assert_eq!(syndrome.iss(), 0x0123);
        assert_eq!(syndrome.instruction_len(), 4);
        assert_eq!(Syndrome(0x0123).instruction_len(), 2);
    }

    #[test]
    fn test_data_abort_decode() {
        // STR w5, [x1]: ISV, SAS=2, SRT=5, WnR
        let iss = (1 << 24) | (2 << 22) | (5 << 16) | (1 << 6);
        let abort = DataAbort::from_iss(iss);
        assert!(abort.isv);
        assert!(abort.wnr);
        assert_eq!(abort.width(), 4);
        assert_eq!(abort.srt, 5);
        assert_eq!(abort.value_mask(), 0xffff_ffff);
    }

    #[test]
    fn test_sign_extension() {
        // LDRSH x0: SAS=1, SSE, SF
        let abort = DataAbort::from_iss((1 << 24) | (1 << 22) | (1 << 21) | (1 << 15));
        assert_eq!(abort.extend_load(0x8000), 0xffff_ffff_ffff_8000);
        assert_eq!(abort.extend_load(0x7fff), 0x7fff);

        // LDRSB w0: SAS=0, SSE, !SF
        let abort = DataAbort::from_iss((1 << 24) | (1 << 21));
        assert_eq!(abort.extend_load(0x80), 0xffff_ff80);

        // LDR x0: no extension
        let abort = DataAbort::from_iss((1 << 24) | (3 << 22) | (1 << 15));
        assert_eq!(abort.extend_load(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_sysreg_access_decode() {
        // MSR CNTV_CTL_EL0, x7
        let iss = (3 << 20) | (1 << 17) | (3 << 14) | (14 << 10) | (7 << 5) | (3 << 1);
        let access = SysRegAccess::from_iss(iss);
        assert_eq!(access.reg, sys::CNTV_CTL_EL0);
        assert_eq!(access.rt, 7);
        assert!(!access.read);
    }
}
