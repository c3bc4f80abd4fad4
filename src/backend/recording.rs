//! In-process backend that records every call.
//!
//! Nothing executes guest code here. `run` replays exits scripted with
//! [`RecordingBackend::push_exit`] and otherwise blocks until
//! [`force_exit`](HypervisorBackend::force_exit), like a guest idling in
//! guest mode. Mappings are checked the way a hypervisor would: a map that
//! overlaps a live mapping, or an unmap of something never mapped, is
//! rejected.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use super::{
    ExitRecord, GuestMemoryMapper, HostAddress, HypervisorBackend, InterruptKind, MemFlags, SlotId,
    VcpuId,
};
use crate::config::OverlapPolicy;
use crate::error::{Error, Result};
use crate::vcpu::regs::{ArchReg, SIMD_COUNT};

/// Default counter frequency, matching Apple silicon.
pub const DEFAULT_COUNTER_FREQUENCY: u64 = 24_000_000;

/// One call observed by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Map {
        slot: SlotId,
        host: HostAddress,
        gpa: u64,
        size: u64,
        flags: MemFlags,
    },
    Unmap {
        slot: SlotId,
        gpa: u64,
        size: u64,
    },
    Protect {
        gpa: u64,
        size: u64,
        flags: MemFlags,
    },
    CreateVcpu(u32),
    DestroyVcpu(u32),
    Run(u32),
    SetPending {
        vcpu: u32,
        kind: InterruptKind,
        pending: bool,
    },
    SetVtimerMask {
        vcpu: u32,
        masked: bool,
    },
    ForceExit(u32),
}

/// A live guest-physical mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub slot: SlotId,
    pub host: HostAddress,
    pub gpa: u64,
    pub size: u64,
    pub flags: MemFlags,
}

impl Mapping {
    pub fn end(&self) -> u64 {
        self.gpa + self.size
    }
}

/// A scripted guest step: register writes applied as if the guest executed
/// up to the exit, then the exit itself.
#[derive(Debug, Clone)]
pub struct ScriptedExit {
    pub writes: Vec<(ArchReg, u64)>,
    pub exit: ExitRecord,
}

impl From<ExitRecord> for ScriptedExit {
    fn from(exit: ExitRecord) -> Self {
        Self {
            writes: Vec::new(),
            exit,
        }
    }
}

/// Handle to a recording vCPU.
#[derive(Debug)]
pub struct RecordingVcpu {
    slot: usize,
    index: u32,
}

impl RecordingVcpu {
    pub fn index(&self) -> u32 {
        self.index
    }
}

#[derive(Debug)]
struct SoftVcpu {
    index: u32,
    live: bool,
    regs: HashMap<ArchReg, u64>,
    simd: [u128; SIMD_COUNT],
    irq: bool,
    fiq: bool,
    vtimer_masked: bool,
    cancel: bool,
    script: VecDeque<ScriptedExit>,
}

impl SoftVcpu {
    fn new(index: u32) -> Self {
        Self {
            index,
            live: true,
            regs: HashMap::new(),
            simd: [0; SIMD_COUNT],
            irq: false,
            fiq: false,
            vtimer_masked: false,
            cancel: false,
            script: VecDeque::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    calls: Vec<BackendCall>,
    mappings: Vec<Mapping>,
    vcpus: Vec<SoftVcpu>,
    // Pending script entries for vCPUs not created yet, by index.
    early_script: HashMap<u32, VecDeque<ScriptedExit>>,
    fail_next: Option<&'static str>,
    counter: Option<u64>,
}

impl Inner {
    fn check_fail(&mut self, op: &'static str) -> Result<()> {
        if self.fail_next == Some(op) {
            self.fail_next = None;
            return Err(Error::backend(op, -1));
        }
        Ok(())
    }

    fn vcpu_by_index(&mut self, index: u32) -> Option<&mut SoftVcpu> {
        self.vcpus.iter_mut().rev().find(|v| v.live && v.index == index)
    }
}

/// Backend that records calls and scripts guest exits.
#[derive(Debug)]
pub struct RecordingBackend {
    inner: Mutex<Inner>,
    wake: Condvar,
    policy: OverlapPolicy,
    frequency: u64,
    epoch: Instant,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBackend {
    /// Create a backend preferring the splitting policy.
    pub fn new() -> Self {
        Self::with_policy(OverlapPolicy::Splitting)
    }

    /// Create a backend that reports `policy` as its preference.
    pub fn with_policy(policy: OverlapPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            wake: Condvar::new(),
            policy,
            frequency: DEFAULT_COUNTER_FREQUENCY,
            epoch: Instant::now(),
        }
    }

    /// Fail the next call of the named operation with a backend rejection.
    pub fn fail_next(&self, op: &'static str) {
        self.inner.lock().fail_next = Some(op);
    }

    /// Calls observed so far.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.inner.lock().calls.clone()
    }

    /// Drain the call log.
    pub fn take_calls(&self) -> Vec<BackendCall> {
        std::mem::take(&mut self.inner.lock().calls)
    }

    /// Live mappings sorted by guest address.
    pub fn mappings(&self) -> Vec<Mapping> {
        let mut mappings = self.inner.lock().mappings.clone();
        mappings.sort_by_key(|m| m.gpa);
        mappings
    }

    /// Queue an exit for the vCPU with `index`.
    pub fn push_exit(&self, index: u32, step: impl Into<ScriptedExit>) {
        let mut inner = self.inner.lock();
        let step = step.into();
        match inner.vcpu_by_index(index) {
            Some(vcpu) => vcpu.script.push_back(step),
            None => inner.early_script.entry(index).or_default().push_back(step),
        }
        self.wake.notify_all();
    }

    /// Register value as the guest sees it.
    pub fn guest_register(&self, index: u32, reg: ArchReg) -> u64 {
        let mut inner = self.inner.lock();
        inner
            .vcpu_by_index(index)
            .and_then(|v| v.regs.get(&reg).copied())
            .unwrap_or(0)
    }

    /// Change a register behind the host's back, as guest execution would.
    pub fn set_guest_register(&self, index: u32, reg: ArchReg, value: u64) {
        let mut inner = self.inner.lock();
        if let Some(vcpu) = inner.vcpu_by_index(index) {
            vcpu.regs.insert(reg, value);
        }
    }

    /// Interrupt line level last set for the vCPU.
    pub fn pending_interrupt(&self, index: u32, kind: InterruptKind) -> bool {
        let mut inner = self.inner.lock();
        inner
            .vcpu_by_index(index)
            .map(|v| match kind {
                InterruptKind::Irq => v.irq,
                InterruptKind::Fiq => v.fiq,
            })
            .unwrap_or(false)
    }

    /// Whether virtual timer exits are masked for the vCPU.
    pub fn vtimer_masked(&self, index: u32) -> bool {
        let mut inner = self.inner.lock();
        inner
            .vcpu_by_index(index)
            .map(|v| v.vtimer_masked)
            .unwrap_or(false)
    }

    /// Pin the virtual counter to a fixed value, or `None` to follow wall time.
    pub fn set_virtual_counter(&self, value: Option<u64>) {
        self.inner.lock().counter = value;
    }
}

impl GuestMemoryMapper for RecordingBackend {
    fn map(
        &self,
        slot: SlotId,
        host: HostAddress,
        gpa: u64,
        size: u64,
        flags: MemFlags,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(BackendCall::Map {
            slot,
            host,
            gpa,
            size,
            flags,
        });
        inner.check_fail("map")?;
        let end = gpa.checked_add(size).ok_or_else(|| Error::backend("map", -2))?;
        if size == 0 {
            return Err(Error::backend("map", -2));
        }
        if inner
            .mappings
            .iter()
            .any(|m| m.slot == slot || (gpa < m.end() && end > m.gpa))
        {
            return Err(Error::backend("map", -3));
        }
        inner.mappings.push(Mapping {
            slot,
            host,
            gpa,
            size,
            flags,
        });
        Ok(())
    }

    fn unmap(&self, slot: SlotId, gpa: u64, size: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(BackendCall::Unmap { slot, gpa, size });
        inner.check_fail("unmap")?;
        let pos = inner
            .mappings
            .iter()
            .position(|m| m.slot == slot && m.gpa == gpa && m.size == size)
            .ok_or_else(|| Error::backend("unmap", -3))?;
        inner.mappings.swap_remove(pos);
        Ok(())
    }

    fn protect(&self, gpa: u64, size: u64, flags: MemFlags) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(BackendCall::Protect { gpa, size, flags });
        inner.check_fail("protect")?;
        let end = gpa.saturating_add(size);
        let mapping = inner
            .mappings
            .iter_mut()
            .find(|m| gpa >= m.gpa && end <= m.end())
            .ok_or_else(|| Error::backend("protect", -3))?;
        if mapping.gpa == gpa && mapping.size == size {
            mapping.flags = flags;
        }
        Ok(())
    }

    fn preferred_policy(&self) -> OverlapPolicy {
        self.policy
    }
}

impl HypervisorBackend for RecordingBackend {
    type Vcpu = RecordingVcpu;

    fn create_vcpu(&self, index: u32) -> Result<RecordingVcpu> {
        let mut inner = self.inner.lock();
        inner.calls.push(BackendCall::CreateVcpu(index));
        inner.check_fail("create_vcpu")?;
        let mut vcpu = SoftVcpu::new(index);
        if let Some(script) = inner.early_script.remove(&index) {
            vcpu.script = script;
        }
        inner.vcpus.push(vcpu);
        Ok(RecordingVcpu {
            slot: inner.vcpus.len() - 1,
            index,
        })
    }

    fn destroy_vcpu(&self, vcpu: RecordingVcpu) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(BackendCall::DestroyVcpu(vcpu.index));
        inner.check_fail("destroy_vcpu")?;
        inner.vcpus[vcpu.slot].live = false;
        Ok(())
    }

    fn vcpu_id(&self, vcpu: &RecordingVcpu) -> VcpuId {
        VcpuId(vcpu.slot as u64)
    }

    fn get_register(&self, vcpu: &RecordingVcpu, reg: ArchReg) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.check_fail("get_register")?;
        Ok(inner.vcpus[vcpu.slot].regs.get(&reg).copied().unwrap_or(0))
    }

    fn set_register(&self, vcpu: &RecordingVcpu, reg: ArchReg, value: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_fail("set_register")?;
        inner.vcpus[vcpu.slot].regs.insert(reg, value);
        Ok(())
    }

    fn get_simd(&self, vcpu: &RecordingVcpu, index: u8) -> Result<u128> {
        let mut inner = self.inner.lock();
        inner.check_fail("get_simd")?;
        inner.vcpus[vcpu.slot]
            .simd
            .get(index as usize)
            .copied()
            .ok_or_else(|| Error::backend("get_simd", -2))
    }

    fn set_simd(&self, vcpu: &RecordingVcpu, index: u8, value: u128) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_fail("set_simd")?;
        let q = inner.vcpus[vcpu.slot]
            .simd
            .get_mut(index as usize)
            .ok_or_else(|| Error::backend("set_simd", -2))?;
        *q = value;
        Ok(())
    }

    fn set_pending_interrupt(
        &self,
        vcpu: &RecordingVcpu,
        kind: InterruptKind,
        pending: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let soft = &mut inner.vcpus[vcpu.slot];
        let previous = match kind {
            InterruptKind::Irq => std::mem::replace(&mut soft.irq, pending),
            InterruptKind::Fiq => std::mem::replace(&mut soft.fiq, pending),
        };
        // Only level changes are logged; the run loop re-asserts every resume.
        if previous != pending {
            inner.calls.push(BackendCall::SetPending {
                vcpu: vcpu.index,
                kind,
                pending,
            });
        }
        inner.check_fail("set_pending_interrupt")
    }

    fn set_vtimer_mask(&self, vcpu: &RecordingVcpu, masked: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(BackendCall::SetVtimerMask {
            vcpu: vcpu.index,
            masked,
        });
        inner.check_fail("set_vtimer_mask")?;
        inner.vcpus[vcpu.slot].vtimer_masked = masked;
        Ok(())
    }

    fn virtual_counter(&self, _vcpu: &RecordingVcpu) -> Result<u64> {
        let inner = self.inner.lock();
        Ok(inner.counter.unwrap_or_else(|| {
            let elapsed = self.epoch.elapsed().as_nanos();
            (elapsed * self.frequency as u128 / 1_000_000_000) as u64
        }))
    }

    fn counter_frequency(&self) -> u64 {
        self.frequency
    }

    fn run(&self, vcpu: &mut RecordingVcpu) -> Result<ExitRecord> {
        let mut inner = self.inner.lock();
        inner.calls.push(BackendCall::Run(vcpu.index));
        inner.check_fail("run")?;
        loop {
            let soft = &mut inner.vcpus[vcpu.slot];
            if soft.cancel {
                soft.cancel = false;
                return Ok(ExitRecord::canceled());
            }
            if let Some(step) = soft.script.pop_front() {
                for (reg, value) in step.writes {
                    soft.regs.insert(reg, value);
                }
                if step.exit.reason == super::ExitReason::VtimerActivated {
                    soft.vtimer_masked = true;
                }
                return Ok(step.exit);
            }
            self.wake.wait(&mut inner);
        }
    }

    fn force_exit(&self, id: VcpuId) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = id.0 as usize;
        let index = inner
            .vcpus
            .get(slot)
            .map(|v| v.index)
            .ok_or_else(|| Error::backend("force_exit", -2))?;
        inner.calls.push(BackendCall::ForceExit(index));
        inner.check_fail("force_exit")?;
        inner.vcpus[slot].cancel = true;
        self.wake.notify_all();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rejects_overlap() {
        let backend = RecordingBackend::new();
        backend
            .map(SlotId(0), HostAddress(0x10000), 0x1000, 0x2000, MemFlags::RWX)
            .unwrap();
        let err = backend
            .map(SlotId(1), HostAddress(0x20000), 0x2000, 0x1000, MemFlags::RWX)
            .unwrap_err();
        assert!(matches!(err, Error::BackendRejection { op: "map", .. }));
        backend.unmap(SlotId(0), 0x1000, 0x2000).unwrap();
        backend
            .map(SlotId(1), HostAddress(0x20000), 0x2000, 0x1000, MemFlags::RWX)
            .unwrap();
        assert_eq!(backend.mappings().len(), 1);
    }

    #[test]
    fn test_unmap_must_match() {
        let backend = RecordingBackend::new();
        backend
            .map(SlotId(0), HostAddress(0x10000), 0x1000, 0x2000, MemFlags::RW)
            .unwrap();
        assert!(backend.unmap(SlotId(0), 0x1000, 0x1000).is_err());
        assert!(backend.unmap(SlotId(0), 0x1000, 0x2000).is_ok());
    }

    #[test]
    fn test_scripted_run() {
        let backend = RecordingBackend::new();
        backend.push_exit(
            0,
            ScriptedExit {
                writes: vec![(ArchReg::Pc, 0x4000)],
                exit: ExitRecord::vtimer(),
            },
        );
        let mut vcpu = backend.create_vcpu(0).unwrap();
        let exit = backend.run(&mut vcpu).unwrap();
        assert_eq!(exit, ExitRecord::vtimer());
        assert_eq!(backend.guest_register(0, ArchReg::Pc), 0x4000);
        assert!(backend.vtimer_masked(0));
    }

    #[test]
    fn test_force_exit_before_run_cancels() {
        let backend = RecordingBackend::new();
        let mut vcpu = backend.create_vcpu(0).unwrap();
        backend.force_exit(backend.vcpu_id(&vcpu)).unwrap();
        assert_eq!(backend.run(&mut vcpu).unwrap(), ExitRecord::canceled());
    }

    #[test]
    fn test_fail_next_is_one_shot() {
        let backend = RecordingBackend::new();
        backend.fail_next("protect");
        backend
            .map(SlotId(0), HostAddress(0x10000), 0, 0x1000, MemFlags::RW)
            .unwrap();
        assert!(backend.protect(0, 0x1000, MemFlags::READ).is_err());
        assert!(backend.protect(0, 0x1000, MemFlags::READ).is_ok());
        assert_eq!(backend.mappings()[0].flags, MemFlags::READ);
    }
}
