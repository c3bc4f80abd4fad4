//! Memory regions and slots.

use crate::backend::{HostAddress, MemFlags, SlotId};
use crate::error::{Error, Result};

/// A request to map host memory into the guest physical address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Host virtual address of the first byte.
    pub host: HostAddress,
    /// Guest physical address of the first byte.
    pub gpa: u64,
    /// Size in bytes.
    pub size: u64,
    /// Guest access permissions.
    pub flags: MemFlags,
}

impl MemoryRegion {
    /// Create a new memory region.
    pub fn new(host: HostAddress, gpa: u64, size: u64, flags: MemFlags) -> Self {
        Self {
            host,
            gpa,
            size,
            flags,
        }
    }

    /// Reject empty intervals and ones that wrap the address space.
    pub fn validate(&self) -> Result<u64> {
        checked_end(self.gpa, self.size)
    }
}

pub(crate) fn checked_end(gpa: u64, size: u64) -> Result<u64> {
    match gpa.checked_add(size) {
        Some(end) if size > 0 => Ok(end),
        _ => Err(Error::InvalidRegion { gpa, size }),
    }
}

/// One entry of the slot table.
///
/// A used slot is mapped in the backend; an unused one never is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub id: SlotId,
    pub used: bool,
    pub guest_start: u64,
    pub size: u64,
    pub host: HostAddress,
    pub flags: MemFlags,
}

impl Slot {
    pub(crate) fn free(id: SlotId) -> Self {
        Self {
            id,
            used: false,
            guest_start: 0,
            size: 0,
            host: HostAddress::default(),
            flags: MemFlags::empty(),
        }
    }

    pub(crate) fn occupy(&mut self, region: &MemoryRegion) {
        self.used = true;
        self.guest_start = region.gpa;
        self.size = region.size;
        self.host = region.host;
        self.flags = region.flags;
    }

    /// Exclusive end of the guest interval.
    pub fn guest_end(&self) -> u64 {
        self.guest_start + self.size
    }

    /// Whether this used slot intersects `[start, end)`.
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.used && start < self.guest_end() && end > self.guest_start
    }

    /// Whether `[start, end)` lies within this slot.
    pub fn covers(&self, start: u64, end: u64) -> bool {
        self.used && start >= self.guest_start && end <= self.guest_end()
    }

    /// Whether `[start, end)` lies within this slot without touching either
    /// boundary.
    pub fn strictly_contains(&self, start: u64, end: u64) -> bool {
        self.used && start > self.guest_start && end < self.guest_end()
    }

    /// Whether this used slot lies entirely within `[start, end)`.
    pub fn within(&self, start: u64, end: u64) -> bool {
        self.used && self.guest_start >= start && self.guest_end() <= end
    }

    /// Host address backing `gpa`, which must lie in the slot.
    pub fn host_for(&self, gpa: u64) -> HostAddress {
        self.host.offset(gpa - self.guest_start)
    }

    /// Same interval, host and permissions as `region`.
    pub fn matches(&self, region: &MemoryRegion) -> bool {
        self.used
            && self.guest_start == region.gpa
            && self.size == region.size
            && self.host == region.host
            && self.flags == region.flags
    }

    /// Same permissions and the same host-minus-guest offset as `region`:
    /// wherever the two overlap, they map the same bytes the same way.
    pub fn is_compatible(&self, region: &MemoryRegion) -> bool {
        self.used
            && self.flags == region.flags
            && self.host.value().wrapping_sub(self.guest_start)
                == region.host.value().wrapping_sub(region.gpa)
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.used {
            write!(
                f,
                "{} [{:#x}, {:#x}) host {:?} {:?}",
                self.id,
                self.guest_start,
                self.guest_end(),
                self.host,
                self.flags
            )
        } else {
            write!(f, "{} free", self.id)
        }
    }
}
