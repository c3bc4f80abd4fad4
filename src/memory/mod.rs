//! Guest physical memory management.
//!
//! This module tracks which guest physical ranges are backed by host
//! memory, and keeps the hypervisor's mappings in step with that view.

mod ram;
mod slot;
mod table;

pub use ram::RamBlock;
pub use slot::{MemoryRegion, Slot};
pub use table::MemorySlotTable;
