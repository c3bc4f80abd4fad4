//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use hvaccel::backend::recording::RecordingBackend;
use hvaccel::vcpu::{class, Syndrome, SysReg};
use hvaccel::{
    DeviceBus, HostAddress, MemFlags, MemoryRegion, MemorySlotTable, OverlapPolicy, RegisterFile,
};

pub const HOST_BASE: usize = 0x7f00_0000_0000;

pub fn region(host: usize, gpa: u64, size: u64, flags: MemFlags) -> MemoryRegion {
    MemoryRegion::new(HostAddress(host), gpa, size, flags)
}

pub fn table(
    capacity: usize,
    policy: OverlapPolicy,
) -> (Arc<RecordingBackend>, MemorySlotTable<RecordingBackend>) {
    let backend = Arc::new(RecordingBackend::new());
    let table = MemorySlotTable::new(backend.clone(), capacity, policy);
    (backend, table)
}

/// `(gpa, end, host, flags)` of every used slot, by guest address.
pub fn layout(table: &MemorySlotTable<RecordingBackend>) -> Vec<(u64, u64, usize, MemFlags)> {
    table
        .slots()
        .iter()
        .map(|s| (s.guest_start, s.guest_end(), s.host.0, s.flags))
        .collect()
}

/// `(gpa, end, host, flags)` of every live backend mapping, by guest address.
pub fn backend_layout(backend: &RecordingBackend) -> Vec<(u64, u64, usize, MemFlags)> {
    backend
        .mappings()
        .iter()
        .map(|m| (m.gpa, m.end(), m.host.0, m.flags))
        .collect()
}

/// Data abort syndrome for an access through `Xsrt`/`Wsrt`.
pub fn data_abort(write: bool, log2_size: u32, srt: u32, sign_extend: bool, sf: bool) -> u64 {
    let mut iss = (1 << 24) | (log2_size << 22) | (srt << 16);
    if sign_extend {
        iss |= 1 << 21;
    }
    if sf {
        iss |= 1 << 15;
    }
    if write {
        iss |= 1 << 6;
    }
    Syndrome::new(class::DABT_LOWER, iss).0
}

/// MSR/MRS trap syndrome.
pub fn sysreg_trap(reg: SysReg, rt: u32, read: bool) -> u64 {
    let iss = (u32::from(reg.op0) << 20)
        | (u32::from(reg.op2) << 17)
        | (u32::from(reg.op1) << 14)
        | (u32::from(reg.crn) << 10)
        | (rt << 5)
        | (u32::from(reg.crm) << 1)
        | u32::from(read);
    Syndrome::new(class::SYS64, iss).0
}

/// WFI (`wfe == false`) or WFE trap syndrome.
pub fn wfx(wfe: bool) -> u64 {
    Syndrome::new(class::WFX, u32::from(wfe)).0
}

/// A device bus that records what the run loop asks of it.
#[derive(Default)]
pub struct TestBus {
    pub reads: Mutex<Vec<(u64, usize)>>,
    pub writes: Mutex<Vec<(u64, usize, u64)>>,
    pub read_values: Mutex<HashMap<u64, u64>>,
    pub vtimer: Mutex<Vec<bool>>,
    pub sysregs: Mutex<HashMap<SysReg, u64>>,
    pub handles_hvc: bool,
}

impl TestBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_hypercalls() -> Arc<Self> {
        Arc::new(Self {
            handles_hvc: true,
            ..Self::default()
        })
    }

    pub fn answer(&self, gpa: u64, value: u64) {
        self.read_values.lock().insert(gpa, value);
    }
}

impl DeviceBus for TestBus {
    fn mmio_read(&self, _vcpu: u32, gpa: u64, size: usize) -> u64 {
        self.reads.lock().push((gpa, size));
        self.read_values.lock().get(&gpa).copied().unwrap_or(0)
    }

    fn mmio_write(&self, _vcpu: u32, gpa: u64, size: usize, value: u64) {
        self.writes.lock().push((gpa, size, value));
    }

    fn set_vtimer_level(&self, _vcpu: u32, level: bool) {
        self.vtimer.lock().push(level);
    }

    fn sysreg_read(&self, _vcpu: u32, reg: SysReg) -> Option<u64> {
        self.sysregs.lock().get(&reg).copied()
    }

    fn sysreg_write(&self, _vcpu: u32, reg: SysReg, value: u64) -> bool {
        let mut sysregs = self.sysregs.lock();
        if let Some(slot) = sysregs.get_mut(&reg) {
            *slot = value;
            true
        } else {
            false
        }
    }

    fn hypercall(&self, _vcpu: u32, regs: &mut RegisterFile, _smc: bool) -> bool {
        if self.handles_hvc {
            regs.set_gp(0, regs.gp(0) + 1);
        }
        self.handles_hvc
    }
}
