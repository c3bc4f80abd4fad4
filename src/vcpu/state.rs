//! Shadow register state and the dirty protocol.
//!
//! While `dirty` is false the backend copy of the registers is
//! authoritative. Any host-side mutation marks the shadow dirty, and the
//! run loop pushes a dirty shadow before the guest resumes.

use crate::backend::HypervisorBackend;
use crate::error::{Error, Result};

use super::regs::{synced_registers, RegisterFile, SIMD_COUNT};

/// Register shadow of one vCPU. Owned by the vCPU's thread.
#[derive(Debug)]
pub struct VcpuState {
    regs: RegisterFile,
    dirty: bool,
    // Shadow reflects the backend as of the last exit (or is authoritative).
    current: bool,
}

impl Default for VcpuState {
    fn default() -> Self {
        Self::new()
    }
}

impl VcpuState {
    /// A fresh vCPU: reset registers, dirty until the first push.
    pub fn new() -> Self {
        Self {
            regs: RegisterFile::reset_state(),
            dirty: true,
            current: true,
        }
    }

    /// True when the shadow holds changes the backend has not seen.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Read-only view of the shadow. May be stale unless dirty or just pulled.
    pub fn regs(&self) -> &RegisterFile {
        &self.regs
    }

    /// Mutable view of the shadow. Marks it dirty.
    pub fn regs_mut(&mut self) -> &mut RegisterFile {
        self.dirty = true;
        self.current = true;
        &mut self.regs
    }

    /// Mark the shadow authoritative without changing it.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
        self.current = true;
    }

    /// Fail unless the shadow reflects the state at the last exit.
    pub fn ensure_current(&self) -> Result<()> {
        if self.current {
            Ok(())
        } else {
            Err(Error::InvariantViolation(
                "exit dispatched on registers not pulled since the last resume".into(),
            ))
        }
    }

    /// Record that the guest is about to run; the shadow goes stale unless
    /// it is re-pulled.
    pub fn note_resumed(&mut self) {
        if !self.dirty {
            self.current = false;
        }
    }

    /// Refresh the shadow from the backend.
    pub fn pull<B: HypervisorBackend + ?Sized>(
        &mut self,
        backend: &B,
        vcpu: &B::Vcpu,
    ) -> Result<()> {
        for reg in synced_registers() {
            let value = backend.get_register(vcpu, reg)?;
            self.regs.set(reg, value);
        }
        for i in 0..SIMD_COUNT {
            self.regs.q[i] = backend.get_simd(vcpu, i as u8)?;
        }
        self.current = true;
        Ok(())
    }

    /// Write the shadow to the backend. Clears dirty only once every
    /// register has been accepted.
    pub fn push<B: HypervisorBackend + ?Sized>(
        &mut self,
        backend: &B,
        vcpu: &B::Vcpu,
    ) -> Result<()> {
        for reg in synced_registers() {
            backend.set_register(vcpu, reg, self.regs.get(reg))?;
        }
        for (i, q) in self.regs.q.iter().enumerate() {
            backend.set_simd(vcpu, i as u8, *q)?;
        }
        self.dirty = false;
        Ok(())
    }

    /// Make the shadow authoritative: pull unless already dirty, then mark
    /// dirty so the caller may mutate it.
    pub fn synchronize<B: HypervisorBackend + ?Sized>(
        &mut self,
        backend: &B,
        vcpu: &B::Vcpu,
    ) -> Result<&mut RegisterFile> {
        if !self.dirty {
            self.pull(backend, vcpu)?;
        }
        Ok(self.regs_mut())
    }

    /// Shadow as of the last exit, pulled if the guest has run since.
    /// Leaves the dirty state alone.
    pub fn current_regs<B: HypervisorBackend + ?Sized>(
        &mut self,
        backend: &B,
        vcpu: &B::Vcpu,
    ) -> Result<&RegisterFile> {
        if !self.current {
            self.pull(backend, vcpu)?;
        }
        Ok(&self.regs)
    }

    /// Install a complete register set and push it, as after reset or init.
    pub fn load<B: HypervisorBackend + ?Sized>(
        &mut self,
        backend: &B,
        vcpu: &B::Vcpu,
        regs: &RegisterFile,
    ) -> Result<()> {
        self.regs = regs.clone();
        self.dirty = true;
        self.current = true;
        self.push(backend, vcpu)
    }
}
