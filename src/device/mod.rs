//! Device-side interface of the run loop.
//!
//! The run loop does not emulate devices. Accesses it cannot satisfy from
//! guest RAM, and interrupt-line changes it observes, are forwarded to a
//! [`DeviceBus`] supplied by the embedder.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::vcpu::regs::{RegisterFile, SysReg};

/// Receiver of emulated accesses and timer line changes from vCPUs.
///
/// Called on the vCPU's own thread while it is outside guest mode.
pub trait DeviceBus: Send + Sync {
    /// Read `size` bytes of device memory at `gpa`.
    fn mmio_read(&self, vcpu: u32, gpa: u64, size: usize) -> u64;

    /// Write `size` bytes of device memory at `gpa`.
    fn mmio_write(&self, vcpu: u32, gpa: u64, size: usize, value: u64);

    /// Drive the vCPU's virtual timer interrupt line.
    fn set_vtimer_level(&self, vcpu: u32, level: bool);

    /// Emulate a read of a trapped system register. `None` if not handled.
    fn sysreg_read(&self, _vcpu: u32, _reg: SysReg) -> Option<u64> {
        None
    }

    /// Emulate a write of a trapped system register. False if not handled.
    fn sysreg_write(&self, _vcpu: u32, _reg: SysReg, _value: u64) -> bool {
        false
    }

    /// Handle an HVC (`smc == false`) or SMC call. The handler may change
    /// any register; return false if the call was not handled.
    fn hypercall(&self, _vcpu: u32, _regs: &mut RegisterFile, _smc: bool) -> bool {
        false
    }
}

/// A device occupying a range of guest physical address space.
pub trait MmioDevice: Send + Sync {
    /// Read `size` bytes at `offset` from the start of the device's range.
    fn read(&self, offset: u64, size: usize) -> u64;

    /// Write `size` bytes at `offset` from the start of the device's range.
    fn write(&self, offset: u64, size: usize, value: u64);
}

type LineCallback = Box<dyn Fn(u32, bool) + Send + Sync>;

struct MmioRange {
    base: u64,
    size: u64,
    device: Arc<dyn MmioDevice>,
}

/// A [`DeviceBus`] that routes MMIO by address range.
///
/// Unclaimed reads return zero and unclaimed writes are dropped.
#[derive(Default)]
pub struct MmioBus {
    ranges: RwLock<Vec<MmioRange>>,
    vtimer: Option<LineCallback>,
}

impl MmioBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoke `callback(vcpu, level)` on virtual timer line changes.
    pub fn with_vtimer_line(mut self, callback: impl Fn(u32, bool) + Send + Sync + 'static) -> Self {
        self.vtimer = Some(Box::new(callback));
        self
    }

    /// Claim `[base, base + size)` for `device`. Returns false if the range
    /// is empty or intersects an existing claim.
    pub fn register(&self, base: u64, size: u64, device: Arc<dyn MmioDevice>) -> bool {
        let Some(end) = base.checked_add(size).filter(|_| size > 0) else {
            return false;
        };
        let mut ranges = self.ranges.write();
        if ranges.iter().any(|r| base < r.base + r.size && end > r.base) {
            return false;
        }
        ranges.push(MmioRange { base, size, device });
        true
    }

    fn lookup(&self, gpa: u64) -> Option<(Arc<dyn MmioDevice>, u64)> {
        self.ranges
            .read()
            .iter()
            .find(|r| gpa >= r.base && gpa - r.base < r.size)
            .map(|r| (r.device.clone(), gpa - r.base))
    }
}

impl DeviceBus for MmioBus {
    fn mmio_read(&self, vcpu: u32, gpa: u64, size: usize) -> u64 {
        match self.lookup(gpa) {
            Some((device, offset)) => device.read(offset, size),
            None => {
                tracing::warn!(vcpu, gpa = format_args!("{:#x}", gpa), size, "unclaimed mmio read");
                0
            }
        }
    }

    fn mmio_write(&self, vcpu: u32, gpa: u64, size: usize, value: u64) {
        match self.lookup(gpa) {
            Some((device, offset)) => device.write(offset, size, value),
            None => tracing::warn!(
                vcpu,
                gpa = format_args!("{:#x}", gpa),
                size,
                value = format_args!("{:#x}", value),
                "unclaimed mmio write"
            ),
        }
    }

    fn set_vtimer_level(&self, vcpu: u32, level: bool) {
        tracing::trace!(vcpu, level, "vtimer line");
        if let Some(callback) = &self.vtimer {
            callback(vcpu, level);
        }
    }
}
