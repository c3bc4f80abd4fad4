//! Guest memory slot table.
//!
//! The table is the single source of truth for which guest physical ranges
//! are backed by which host memory. It owns a fixed arena of slots, and
//! every backend map or unmap goes through it under one lock, so the
//! backend never sees two mappings covering the same guest address.
//!
//! Two overlap policies are supported:
//!
//! - [`OverlapPolicy::Strict`]: a request must be disjoint from every slot
//!   or hit one slot's interval exactly.
//! - [`OverlapPolicy::Splitting`]: overlapping slots are truncated, freed,
//!   or split in two so that only the requested interval changes.
//!
//! If the backend rejects a call partway through an update, the table and
//! the backend may disagree. The table then refuses further updates.

use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;

use super::slot::{checked_end, MemoryRegion, Slot};
use crate::backend::{GuestMemoryMapper, HostAddress, MemFlags, SlotId};
use crate::config::{AccelConfig, OverlapPolicy};
use crate::error::{Error, Result};

/// Bookkeeping for guest physical memory slots.
pub struct MemorySlotTable<M: ?Sized> {
    mapper: Arc<M>,
    policy: OverlapPolicy,
    arena: Mutex<SlotArena>,
}

struct SlotArena {
    slots: Vec<Slot>,
    poisoned: bool,
}

impl SlotArena {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|i| Slot::free(SlotId(i as u32))).collect(),
            poisoned: false,
        }
    }

    fn check_usable(&self) -> Result<()> {
        if self.poisoned {
            Err(Error::TablePoisoned)
        } else {
            Ok(())
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn free_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.used).count()
    }

    fn allocate(&self) -> Option<usize> {
        self.slots.iter().position(|s| !s.used)
    }

    fn overlapping(&self, start: u64, end: u64) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.overlaps(start, end))
            .map(|(i, _)| i)
            .collect()
    }

    fn conflict(&self, what: &str, start: u64, end: u64) -> Error {
        let mut msg = format!("{what} [{start:#x}, {end:#x})");
        for i in self.overlapping(start, end) {
            let _ = write!(msg, "; overlaps {}", self.slots[i]);
        }
        Error::InvariantViolation(msg)
    }

    fn exhausted(&self, start: u64, end: u64) -> Error {
        Error::ResourceExhaustion {
            start,
            end,
            capacity: self.capacity(),
        }
    }
}

impl<M: GuestMemoryMapper + ?Sized> MemorySlotTable<M> {
    /// Create an empty table of `capacity` slots.
    pub fn new(mapper: Arc<M>, capacity: usize, policy: OverlapPolicy) -> Self {
        tracing::debug!(capacity, %policy, "creating memory slot table");
        Self {
            mapper,
            policy,
            arena: Mutex::new(SlotArena::new(capacity)),
        }
    }

    /// Create a table sized and configured from `config`, falling back to the
    /// mapper's preferred policy.
    pub fn with_config(mapper: Arc<M>, config: &AccelConfig) -> Self {
        let preferred = mapper.preferred_policy();
        let policy = config.overlap_policy.unwrap_or(preferred);
        if policy != preferred {
            tracing::warn!(%policy, %preferred, "overriding backend overlap policy");
        }
        Self::new(mapper, config.slot_capacity, policy)
    }

    /// The overlap policy in effect.
    pub fn policy(&self) -> OverlapPolicy {
        self.policy
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.arena.lock().capacity()
    }

    /// Number of used slots.
    pub fn used_count(&self) -> usize {
        let arena = self.arena.lock();
        arena.capacity() - arena.free_count()
    }

    /// Whether an earlier backend failure left the table unusable.
    pub fn is_poisoned(&self) -> bool {
        self.arena.lock().poisoned
    }

    /// Snapshot of the used slots, ordered by guest address.
    pub fn slots(&self) -> Vec<Slot> {
        let arena = self.arena.lock();
        let mut slots: Vec<Slot> = arena.slots.iter().filter(|s| s.used).copied().collect();
        slots.sort_by_key(|s| s.guest_start);
        slots
    }

    /// Map `region` into the guest, reconciling it with existing slots.
    ///
    /// Re-adding an interval that is already mapped identically is a no-op.
    pub fn add_region(&self, region: MemoryRegion) -> Result<()> {
        let end = region.validate()?;
        let mut arena = self.arena.lock();
        arena.check_usable()?;
        tracing::debug!(
            gpa = format_args!("{:#x}", region.gpa),
            size = format_args!("{:#x}", region.size),
            host = ?region.host,
            flags = ?region.flags,
            "add region"
        );
        match self.policy {
            OverlapPolicy::Strict => self.add_strict(&mut arena, &region, end),
            OverlapPolicy::Splitting => self.update_split(&mut arena, Some(&region), region.gpa, end),
        }
    }

    /// Unmap `[gpa, gpa + size)` from the guest. Removing an unmapped range
    /// is a no-op.
    pub fn remove_region(&self, gpa: u64, size: u64) -> Result<()> {
        let end = checked_end(gpa, size)?;
        let mut arena = self.arena.lock();
        arena.check_usable()?;
        tracing::debug!(
            gpa = format_args!("{:#x}", gpa),
            size = format_args!("{:#x}", size),
            "remove region"
        );
        match self.policy {
            OverlapPolicy::Strict => self.remove_strict(&mut arena, gpa, end),
            OverlapPolicy::Splitting => self.update_split(&mut arena, None, gpa, end),
        }
    }

    /// Change guest permissions on a mapped range.
    ///
    /// The range must lie within one slot. The slot's recorded flags follow
    /// only when the whole slot is protected.
    pub fn protect_region(&self, gpa: u64, size: u64, flags: MemFlags) -> Result<()> {
        let end = checked_end(gpa, size)?;
        let mut arena = self.arena.lock();
        arena.check_usable()?;
        let i = arena
            .slots
            .iter()
            .position(|s| s.covers(gpa, end))
            .ok_or_else(|| arena.conflict("protect of unmapped range", gpa, end))?;
        if let Err(err) = self.mapper.protect(gpa, size, flags) {
            arena.poisoned = true;
            return Err(err);
        }
        let slot = &mut arena.slots[i];
        if slot.guest_start == gpa && slot.size == size {
            slot.flags = flags;
        }
        Ok(())
    }

    /// First used slot intersecting `[start, end)`.
    pub fn find_overlap(&self, start: u64, end: u64) -> Option<Slot> {
        let arena = self.arena.lock();
        arena.slots.iter().find(|s| s.overlaps(start, end)).copied()
    }

    /// Host address backing guest address `gpa`, if it is mapped.
    pub fn host_address_for(&self, gpa: u64) -> Option<HostAddress> {
        self.find_overlap(gpa, gpa.saturating_add(1))
            .map(|slot| slot.host_for(gpa))
    }

    /// Guest ranges `(gpa, len)` backed by host bytes `[host, host + len)`.
    pub fn guest_ranges_for_host(&self, host: HostAddress, len: u64) -> Vec<(u64, u64)> {
        let lo = host.value();
        let hi = lo.saturating_add(len);
        let arena = self.arena.lock();
        let mut ranges: Vec<(u64, u64)> = arena
            .slots
            .iter()
            .filter(|s| s.used)
            .filter_map(|s| {
                let start = lo.max(s.host.value());
                let end = hi.min(s.host.value() + s.size);
                (start < end).then(|| (s.guest_start + (start - s.host.value()), end - start))
            })
            .collect();
        ranges.sort_unstable();
        ranges
    }

    /// Human-readable listing of the used slots, for fatal diagnostics.
    pub fn dump(&self) -> String {
        let mut out = format!("slot table ({}, {}):", self.policy, if self.is_poisoned() {
            "poisoned"
        } else {
            "consistent"
        });
        for slot in self.slots() {
            let _ = write!(out, "\n  {slot}");
        }
        out
    }

    fn commit(&self, arena: &mut SlotArena, i: usize) -> Result<()> {
        let slot = arena.slots[i];
        tracing::trace!(%slot, "map slot");
        self.mapper
            .map(slot.id, slot.host, slot.guest_start, slot.size, slot.flags)
            .map_err(|err| {
                arena.poisoned = true;
                err
            })
    }

    fn teardown(&self, arena: &mut SlotArena, i: usize) -> Result<()> {
        let slot = arena.slots[i];
        tracing::trace!(%slot, "unmap slot");
        self.mapper
            .unmap(slot.id, slot.guest_start, slot.size)
            .map_err(|err| {
                arena.poisoned = true;
                err
            })
    }

    fn add_strict(&self, arena: &mut SlotArena, region: &MemoryRegion, end: u64) -> Result<()> {
        let overlapping = arena.overlapping(region.gpa, end);
        match overlapping.as_slice() {
            [] => {}
            [i] if arena.slots[*i].matches(region) => return Ok(()),
            [i] if arena.slots[*i].guest_start == region.gpa && arena.slots[*i].size == region.size => {
                // Same interval, new backing or permissions.
                self.teardown(arena, *i)?;
                arena.slots[*i].occupy(region);
                return self.commit(arena, *i);
            }
            _ => return Err(arena.conflict("partial overlap adding", region.gpa, end)),
        }
        let i = arena
            .allocate()
            .ok_or_else(|| arena.exhausted(region.gpa, end))?;
        arena.slots[i].occupy(region);
        self.commit(arena, i)
    }

    fn remove_strict(&self, arena: &mut SlotArena, start: u64, end: u64) -> Result<()> {
        let overlapping = arena.overlapping(start, end);
        let exact = |i: usize| {
            let slot = &arena.slots[i];
            slot.guest_start == start && slot.guest_end() == end
        };
        if !overlapping.iter().all(|&i| exact(i)) {
            return Err(arena.conflict("inexact overlap removing", start, end));
        }
        for i in overlapping {
            self.teardown(arena, i)?;
            arena.slots[i] = Slot::free(arena.slots[i].id);
        }
        Ok(())
    }

    /// Apply an add (`Some`) or removal (`None`) of `[start, end)` under the
    /// splitting policy.
    fn update_split(
        &self,
        arena: &mut SlotArena,
        add: Option<&MemoryRegion>,
        start: u64,
        end: u64,
    ) -> Result<()> {
        let mut overlapping = Vec::new();
        let mut split = None;
        for (i, slot) in arena.slots.iter().enumerate() {
            if !slot.overlaps(start, end) {
                continue;
            }
            if let Some(region) = add {
                if slot.matches(region) || (slot.is_compatible(region) && slot.covers(start, end)) {
                    tracing::trace!(%slot, "already mapped");
                    return Ok(());
                }
            }
            // Compatible interior adds returned above, so this one changes
            // the mapping of the middle of the slot.
            if slot.strictly_contains(start, end) {
                split = Some(i);
            }
            overlapping.push(i);
        }

        if split.is_some() && overlapping.len() > 1 {
            return Err(arena.conflict("split alongside other overlaps", start, end));
        }

        // Check capacity before touching the backend.
        let freed = overlapping
            .iter()
            .filter(|&&i| arena.slots[i].within(start, end))
            .count();
        let needed = usize::from(split.is_some()) + usize::from(add.is_some());
        if needed > arena.free_count() + freed {
            return Err(arena.exhausted(start, end));
        }

        for &i in &overlapping {
            self.teardown(arena, i)?;
        }

        for &i in &overlapping {
            if Some(i) == split {
                continue;
            }
            let slot = arena.slots[i];
            if slot.within(start, end) {
                arena.slots[i] = Slot::free(slot.id);
                continue;
            }
            // Partial overlap: exactly one side survives.
            let (keep_start, keep_end) = if slot.guest_start < start {
                (slot.guest_start, start)
            } else {
                (end, slot.guest_end())
            };
            let remainder = &mut arena.slots[i];
            remainder.host = slot.host_for(keep_start);
            remainder.guest_start = keep_start;
            remainder.size = keep_end - keep_start;
            self.commit(arena, i)?;
        }

        if let Some(i) = split {
            let slot = arena.slots[i];
            let right = arena
                .allocate()
                .ok_or_else(|| Error::InvariantViolation("free slot accounting".into()))?;
            arena.slots[right].occupy(&MemoryRegion::new(
                slot.host_for(end),
                end,
                slot.guest_end() - end,
                slot.flags,
            ));
            self.commit(arena, right)?;
            arena.slots[i].size = start - slot.guest_start;
            self.commit(arena, i)?;
        }

        if let Some(region) = add {
            let i = arena
                .allocate()
                .ok_or_else(|| Error::InvariantViolation("free slot accounting".into()))?;
            arena.slots[i].occupy(region);
            self.commit(arena, i)?;
        }
        Ok(())
    }
}

impl<M: ?Sized> std::fmt::Debug for MemorySlotTable<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let arena = self.arena.lock();
        f.debug_struct("MemorySlotTable")
            .field("policy", &self.policy)
            .field("capacity", &arena.slots.len())
            .field("poisoned", &arena.poisoned)
            .finish()
    }
}
