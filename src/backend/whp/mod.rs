//! Windows Hypervisor Platform (WHP) backend.
//!
//! Only guest memory mapping is provided: [`WhpMemory`] owns a partition
//! and implements [`GuestMemoryMapper`], so a [`MemorySlotTable`] can keep
//! a WHP partition's physical address space in step with the emulator.
//!
//! ## Requirements
//!
//! - Windows 10 version 1803 or later
//! - Hyper-V enabled in Windows Features
//! - Virtualization enabled in BIOS/UEFI
//!
//! [`MemorySlotTable`]: crate::memory::MemorySlotTable

mod bindings;

use std::collections::BTreeMap;

use parking_lot::Mutex;
use windows::Win32::System::Hypervisor::*;

use self::bindings::{map_flags, whp_error};
use crate::backend::{GuestMemoryMapper, HostAddress, MemFlags, SlotId};
use crate::error::{Error, Result};

/// Check if WHP is available on this system.
pub fn is_available() -> bool {
    bindings::check_whp_available()
}

#[derive(Debug, Clone, Copy)]
struct WhpMapping {
    host: HostAddress,
    size: u64,
    flags: MemFlags,
}

/// A WHP partition used for guest memory mapping.
pub struct WhpMemory {
    partition: WHV_PARTITION_HANDLE,
    // WHP has no protect call; mappings are remembered so a permission change
    // can be done as unmap + map.
    mappings: Mutex<BTreeMap<u64, WhpMapping>>,
}

// Safety: the partition handle may be used from any thread.
unsafe impl Send for WhpMemory {}
unsafe impl Sync for WhpMemory {}

impl WhpMemory {
    /// Create and set up a partition with `processor_count` processors.
    pub fn new(processor_count: u32) -> Result<Self> {
        if !is_available() {
            return Err(Error::HypervisorNotAvailable);
        }

        unsafe {
            let partition =
                WHvCreatePartition().map_err(|e| whp_error("WHvCreatePartition", e))?;

            let property = WHV_PARTITION_PROPERTY {
                ProcessorCount: processor_count,
            };
            let setup = WHvSetPartitionProperty(
                partition,
                WHvPartitionPropertyCodeProcessorCount,
                &property as *const _ as *const _,
                std::mem::size_of::<WHV_PARTITION_PROPERTY>() as u32,
            )
            .map_err(|e| whp_error("WHvSetPartitionProperty", e))
            .and_then(|_| {
                WHvSetupPartition(partition).map_err(|e| whp_error("WHvSetupPartition", e))
            });

            if let Err(err) = setup {
                let _ = WHvDeletePartition(partition);
                return Err(err);
            }

            tracing::info!(processor_count, "WHP partition created");
            Ok(Self {
                partition,
                mappings: Mutex::new(BTreeMap::new()),
            })
        }
    }
}

impl Drop for WhpMemory {
    fn drop(&mut self) {
        if let Err(e) = unsafe { WHvDeletePartition(self.partition) } {
            tracing::warn!("WHvDeletePartition: {e}");
        }
    }
}

impl GuestMemoryMapper for WhpMemory {
    fn map(
        &self,
        slot: SlotId,
        host: HostAddress,
        gpa: u64,
        size: u64,
        flags: MemFlags,
    ) -> Result<()> {
        tracing::trace!(%slot, ?host, gpa = format_args!("{gpa:#x}"), size, "WHvMapGpaRange");
        let mut mappings = self.mappings.lock();
        unsafe {
            WHvMapGpaRange(
                self.partition,
                host.as_ptr() as *const _,
                gpa,
                size,
                map_flags(flags),
            )
        }
        .map_err(|e| whp_error("WHvMapGpaRange", e))?;
        mappings.insert(gpa, WhpMapping { host, size, flags });
        Ok(())
    }

    fn unmap(&self, slot: SlotId, gpa: u64, size: u64) -> Result<()> {
        tracing::trace!(%slot, gpa = format_args!("{gpa:#x}"), size, "WHvUnmapGpaRange");
        let mut mappings = self.mappings.lock();
        unsafe { WHvUnmapGpaRange(self.partition, gpa, size) }
            .map_err(|e| whp_error("WHvUnmapGpaRange", e))?;
        mappings.remove(&gpa);
        Ok(())
    }

    fn protect(&self, gpa: u64, size: u64, flags: MemFlags) -> Result<()> {
        let mut mappings = self.mappings.lock();
        let mapping = match mappings.get(&gpa) {
            Some(m) if m.size == size => *m,
            // Sub-range permission changes would need a split.
            _ => return Err(Error::backend("protect", -1i64)),
        };
        if mapping.flags == flags {
            return Ok(());
        }

        unsafe {
            WHvUnmapGpaRange(self.partition, gpa, size)
                .map_err(|e| whp_error("WHvUnmapGpaRange", e))?;
            WHvMapGpaRange(
                self.partition,
                mapping.host.as_ptr() as *const _,
                gpa,
                size,
                map_flags(flags),
            )
            .map_err(|e| whp_error("WHvMapGpaRange", e))?;
        }
        mappings.insert(gpa, WhpMapping { flags, ..mapping });
        Ok(())
    }
}
