/*
 * Copyright 2026 BadgeVMS Contributors
 *
 * This file is part of BadgeVMS.
 *
 * BadgeVMS is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * BadgeVMS is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * BadgeVMS. If not, see <https://www.gnu.org/licenses/>.
 */

//! Per-task virtual memory: `sbrk`-style growth over demand-allocated physical
//! pages, context-switch remap/unmap, and the writeback/invalidate cache
//! discipline that keeps a task's view of memory coherent across a switch.
//!
//! The real MMU register encoding is a hardware collaborator (spec §1's
//! non-goal); it is modeled here as the [`Mmu`] trait so the ordering
//! invariants (writeback before unmap, invalidate before/after map) can be
//! asserted in tests without real hardware.

use crate::error::{EResult, KernelError};
use crate::memory::buddy::{AllocKind, PageAllocator};
use crate::memory::PAGE_SIZE;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;

/// The MMU edit / cache-maintenance primitive that hardware provides.
///
/// A task's address space is managed purely in terms of this trait; the real
/// firmware backs it with SoC-specific MMU table writes, while tests use a
/// `RecordingMmu` that keeps an in-memory shadow of every mapping so the
/// ordering invariants of spec §4.2 can be checked directly.
pub trait Mmu: Send + Sync {
    /// Maps `len` bytes of physical address `paddr` at virtual address `vaddr`.
    fn map(&self, vaddr: u64, paddr: u64, len: u64);
    /// Unmaps `len` bytes starting at `vaddr`. Must be idempotent if nothing is
    /// currently mapped there.
    fn unmap(&self, vaddr: u64, len: u64);
    /// Writes back any dirty cache lines covering `[vaddr, vaddr+len)` to the
    /// backing physical page, without invalidating them.
    fn writeback(&self, vaddr: u64, len: u64);
    /// Invalidates cache lines covering `[vaddr, vaddr+len)` so a subsequent
    /// read refetches from physical memory.
    fn invalidate(&self, vaddr: u64, len: u64);
}

impl<T: Mmu + ?Sized> Mmu for std::sync::Arc<T> {
    fn map(&self, vaddr: u64, paddr: u64, len: u64) {
        (**self).map(vaddr, paddr, len)
    }
    fn unmap(&self, vaddr: u64, len: u64) {
        (**self).unmap(vaddr, len)
    }
    fn writeback(&self, vaddr: u64, len: u64) {
        (**self).writeback(vaddr, len)
    }
    fn invalidate(&self, vaddr: u64, len: u64) {
        (**self).invalidate(vaddr, len)
    }
}

/// One contiguous virtual-to-physical mapping owned by a task.
///
/// Ranges are kept in most-recently-extended-first order (spec §3): `sbrk`
/// growth pushes new ranges to the front, and shrink walks from the front.
#[derive(Debug, Clone, Copy)]
pub struct VirtualRange {
    pub vaddr_start: u64,
    pub paddr_start: u64,
    pub size: u64,
}

impl VirtualRange {
    fn vaddr_end(&self) -> u64 {
        self.vaddr_start + self.size
    }
}

/// A task's user virtual arena: the `[start, end)` span and the ranges that
/// back it. `end - start == size` always holds; the union of `ranges` equals
/// `[start, end)` exactly (spec §4.2 invariant).
pub struct Arena {
    pub start: u64,
    pub end: u64,
    /// Most-recently-extended-first.
    pub ranges: Vec<VirtualRange>,
}

impl Arena {
    fn new(start: u64) -> Self {
        Self {
            start,
            end: start,
            ranges: Vec::new(),
        }
    }

    fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// PID of the task currently mapped into the MMU, or `None`.
///
/// Spec §4.2: "process-wide invariant `current_mapped_task` ∈ {0, task.pid}" —
/// at most one task's ranges are ever resident at a time.
pub struct VMemMgr<M: Mmu> {
    mmu: M,
    page_alloc: PageAllocator,
    vaddr_high: u64,
    current_mapped_task: AtomicU16,
    arenas: Mutex<std::collections::HashMap<u16, Arena>>,
}

impl<M: Mmu> VMemMgr<M> {
    pub fn new(mmu: M, page_alloc: PageAllocator, vaddr_task_start: u64, vaddr_high: u64) -> Self {
        let _ = vaddr_task_start;
        Self {
            mmu,
            page_alloc,
            vaddr_high,
            current_mapped_task: AtomicU16::new(0),
            arenas: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Registers a fresh, empty arena for `pid` starting at `arena_start`.
    pub fn create_arena(&self, pid: u16, arena_start: u64) {
        self.arenas.lock().unwrap().insert(pid, Arena::new(arena_start));
    }

    /// Releases `pid`'s arena: frees every physical range back to the page
    /// allocator. Called by Hades once a `TaskThread`'s refcount hits zero.
    pub fn destroy_arena(&self, pid: u16) -> EResult<()> {
        let mut arenas = self.arenas.lock().unwrap();
        if let Some(arena) = arenas.remove(&pid) {
            for range in &arena.ranges {
                self.page_alloc.deallocate(range.paddr_start)?;
            }
        }
        Ok(())
    }

    pub fn arena_size(&self, pid: u16) -> Option<u64> {
        self.arenas.lock().unwrap().get(&pid).map(Arena::size)
    }

    /// `sbrk` grow case. Returns the arena's old `end` on success.
    fn sbrk_grow(&self, pid: u16, delta: u64) -> EResult<u64> {
        let mut arenas = self.arenas.lock().unwrap();
        let arena = arenas
            .get_mut(&pid)
            .ok_or(KernelError::InvalidArgument("sbrk: unknown task"))?;

        if arena.end + delta > self.vaddr_high {
            return Err(KernelError::ResourceExhaustion("sbrk: exceeds user vaddr arena"));
        }

        let mut remaining = crate::memory::pages_for(delta as usize) as u32;
        let mut new_ranges: Vec<VirtualRange> = Vec::new();
        let mut next_vaddr = arena.end;

        // Request the largest contiguous physical allocation we can get, in
        // descending powers of two, until `remaining` pages are covered.
        let mut rollback_err: Option<KernelError> = None;
        while remaining > 0 {
            let order = crate::memory::order_for_pages_floor(remaining as usize);
            let mut acquired = None;
            let mut try_order = order;
            loop {
                let pages = crate::memory::pages_in_order(try_order) as u32;
                match self
                    .page_alloc
                    .allocate(pages as usize * PAGE_SIZE, AllocKind::Task, 0)
                {
                    Ok(paddr) => {
                        acquired = Some((paddr, pages));
                        break;
                    }
                    Err(_) if try_order > 0 => try_order -= 1,
                    Err(e) => {
                        rollback_err = Some(e);
                        break;
                    }
                }
            }
            let Some((paddr, pages)) = acquired else {
                break;
            };
            let size = pages as u64 * PAGE_SIZE as u64;
            new_ranges.push(VirtualRange {
                vaddr_start: next_vaddr,
                paddr_start: paddr,
                size,
            });
            next_vaddr += size;
            remaining = remaining.saturating_sub(pages);
        }

        if remaining > 0 {
            // Partial failure: roll back every page we did manage to grab.
            for r in &new_ranges {
                let _ = self.page_alloc.deallocate(r.paddr_start);
            }
            return Err(rollback_err.unwrap_or(KernelError::ResourceExhaustion("sbrk: out of physical pages")));
        }

        let old_end = arena.end;
        let window_start = old_end;
        let window_len = next_vaddr - old_end;

        // Critical section: map every new range, then invalidate the whole new
        // window once, splice the ranges to the front, update bookkeeping.
        for r in &new_ranges {
            self.mmu.map(r.vaddr_start, r.paddr_start, r.size);
        }
        self.mmu.invalidate(window_start, window_len);

        new_ranges.reverse(); // keep most-recently-extended-first after splice
        for r in new_ranges {
            arena.ranges.insert(0, r);
        }
        arena.end = next_vaddr;

        Ok(old_end)
    }

    /// `sbrk` shrink case. Returns the arena's old `end`.
    fn sbrk_shrink(&self, pid: u16, delta: u64) -> EResult<u64> {
        let mut arenas = self.arenas.lock().unwrap();
        let arena = arenas
            .get_mut(&pid)
            .ok_or(KernelError::InvalidArgument("sbrk: unknown task"))?;

        let old_end = arena.end;
        let mut remaining = delta.min(arena.size());

        while remaining > 0 && !arena.ranges.is_empty() {
            let range = arena.ranges[0];
            if range.size <= remaining {
                self.mmu.writeback(range.vaddr_start, range.size);
                self.mmu.unmap(range.vaddr_start, range.size);
                self.page_alloc.deallocate(range.paddr_start)?;
                remaining -= range.size;
                arena.ranges.remove(0);
            } else {
                let keep = range.size - remaining;
                self.mmu.writeback(range.vaddr_start, keep);
                self.mmu.unmap(range.vaddr_start, range.size);
                // The buddy allocator only frees (and hands out) whole
                // allocations, so a partial-range shrink can't release just
                // the tail: free the whole block, then re-acquire a fresh
                // block sized to the retained prefix.
                self.page_alloc.deallocate(range.paddr_start)?;
                let new_paddr = self.page_alloc.allocate(keep as usize, AllocKind::Task, 0)?;
                self.mmu.map(range.vaddr_start, new_paddr, keep);
                self.mmu.invalidate(range.vaddr_start, keep);

                arena.ranges[0].paddr_start = new_paddr;
                arena.ranges[0].size = keep;
                remaining = 0;
            }
        }

        arena.end -= delta.min(old_end - arena.start);
        Ok(old_end)
    }

    /// The single `sbrk` entry point, dispatching on the sign of `delta`.
    pub fn sbrk(&self, pid: u16, delta: i64) -> EResult<u64> {
        if delta == 0 {
            let arenas = self.arenas.lock().unwrap();
            return arenas
                .get(&pid)
                .map(|a| a.end)
                .ok_or(KernelError::InvalidArgument("sbrk: unknown task"));
        }
        if delta > 0 {
            self.sbrk_grow(pid, delta as u64)
        } else {
            self.sbrk_shrink(pid, (-delta) as u64)
        }
    }

    /// Context-switch hook: unmaps the currently-resident task, if any.
    /// Idempotent if no task is currently mapped.
    pub fn unmap_current(&self) -> EResult<()> {
        let pid = self.current_mapped_task.load(Ordering::SeqCst);
        if pid == 0 {
            return Ok(());
        }
        let arenas = self.arenas.lock().unwrap();
        if let Some(arena) = arenas.get(&pid) {
            if arena.size() > 0 {
                self.mmu.writeback(arena.start, arena.size());
            }
            for r in &arena.ranges {
                self.mmu.unmap(r.vaddr_start, r.size);
            }
        }
        self.current_mapped_task.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Context-switch hook: maps `pid`'s ranges in. Must not be called while
    /// another task is resident.
    pub fn map(&self, pid: u16) -> EResult<()> {
        let current = self.current_mapped_task.load(Ordering::SeqCst);
        if current != 0 && current != pid {
            return Err(KernelError::ContractViolation(
                "map: another task is already mapped",
            ));
        }
        let arenas = self.arenas.lock().unwrap();
        let Some(arena) = arenas.get(&pid) else {
            return Err(KernelError::InvalidArgument("map: unknown task"));
        };
        for r in &arena.ranges {
            self.mmu.map(r.vaddr_start, r.paddr_start, r.size);
        }
        if arena.size() > 0 {
            self.mmu.invalidate(arena.start, arena.size());
        }
        self.current_mapped_task.store(pid, Ordering::SeqCst);
        Ok(())
    }

    pub fn page_allocator(&self) -> &PageAllocator {
        &self.page_alloc
    }
}

#[cfg(test)]
pub mod test_support {
    use super::Mmu;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Records every map/unmap/writeback/invalidate call and keeps a shadow
    /// mapping table, so tests can assert both ordering and final state.
    #[derive(Default)]
    pub struct RecordingMmu {
        pub log: Mutex<Vec<String>>,
        pub mapped: Mutex<BTreeMap<u64, (u64, u64)>>, // vaddr -> (paddr, len)
    }

    impl RecordingMmu {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    impl Mmu for RecordingMmu {
        fn map(&self, vaddr: u64, paddr: u64, len: u64) {
            self.log.lock().unwrap().push(format!("map({vaddr:#x},{paddr:#x},{len:#x})"));
            self.mapped.lock().unwrap().insert(vaddr, (paddr, len));
        }

        fn unmap(&self, vaddr: u64, len: u64) {
            self.log.lock().unwrap().push(format!("unmap({vaddr:#x},{len:#x})"));
            self.mapped.lock().unwrap().remove(&vaddr);
        }

        fn writeback(&self, vaddr: u64, len: u64) {
            self.log.lock().unwrap().push(format!("writeback({vaddr:#x},{len:#x})"));
        }

        fn invalidate(&self, vaddr: u64, len: u64) {
            self.log.lock().unwrap().push(format!("invalidate({vaddr:#x},{len:#x})"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingMmu;
    use super::*;
    use crate::memory::buddy::PoolFlags;

    fn mgr(pages: u64) -> VMemMgr<RecordingMmu> {
        let pa = PageAllocator::new();
        pa.init_pool(0, pages * PAGE_SIZE as u64, PoolFlags::NONE);
        VMemMgr::new(RecordingMmu::new(), pa, 0x1000_0000, 0x1000_0000 + pages * PAGE_SIZE as u64)
    }

    #[test]
    fn grow_then_shrink_restores_end() {
        let m = mgr(16);
        let pid = 1;
        m.create_arena(pid, 0x1000_0000);
        let free_before = m.page_allocator().free_pages_total();
        let old_end = m.sbrk(pid, 4 * PAGE_SIZE as i64).unwrap();
        assert_eq!(old_end, 0x1000_0000);
        m.sbrk(pid, -(4 * PAGE_SIZE as i64)).unwrap();
        assert_eq!(m.arena_size(pid).unwrap(), 0);
        assert_eq!(m.page_allocator().free_pages_total(), free_before);
    }

    #[test]
    fn shrink_frees_the_tail_page_and_a_grow_back_reads_fresh() {
        let m = mgr(16);
        let pid = 1;
        m.create_arena(pid, 0x2000_0000);
        m.sbrk(pid, 2 * PAGE_SIZE as i64).unwrap();
        m.sbrk(pid, -(PAGE_SIZE as i64)).unwrap();
        // The freed page's physical address must no longer be part of the arena.
        let arenas = m.arenas.lock().unwrap();
        let arena = &arenas[&pid];
        assert_eq!(arena.ranges[0].size, PAGE_SIZE as u64);
    }

    #[test]
    fn switch_sequence_writes_back_before_unmap_and_invalidates_after_map() {
        let m = mgr(16);
        m.create_arena(1, 0x1000_0000);
        m.create_arena(2, 0x2000_0000);
        m.sbrk(1, PAGE_SIZE as i64).unwrap();
        m.sbrk(2, PAGE_SIZE as i64).unwrap();

        m.map(1).unwrap();
        m.unmap_current().unwrap();
        m.map(2).unwrap();
        m.unmap_current().unwrap();
        m.map(1).unwrap();

        let events = m.mmu.events();
        let writeback_1 = events.iter().position(|e| e.starts_with("writeback")).unwrap();
        let unmap_1 = events.iter().position(|e| e.starts_with("unmap")).unwrap();
        assert!(writeback_1 < unmap_1, "writeback must precede unmap on switch-out");

        let last_map = events.iter().rposition(|e| e.starts_with("map(")).unwrap();
        let last_invalidate = events.iter().rposition(|e| e.starts_with("invalidate")).unwrap();
        assert!(last_invalidate > last_map, "invalidate must follow map on switch-in");
    }

    #[test]
    fn unmap_current_is_idempotent_with_nothing_mapped() {
        let m = mgr(4);
        m.create_arena(1, 0x1000_0000);
        assert!(m.unmap_current().is_ok());
        assert!(m.unmap_current().is_ok());
    }

    #[test]
    fn map_rejects_switching_onto_a_different_task_while_one_is_resident() {
        let m = mgr(8);
        m.create_arena(1, 0x1000_0000);
        m.create_arena(2, 0x2000_0000);
        m.map(1).unwrap();
        assert!(matches!(m.map(2), Err(KernelError::ContractViolation(_))));
        m.unmap_current().unwrap();
        assert!(m.map(2).is_ok());
    }

    #[test]
    fn grow_failure_rolls_back_partial_allocation() {
        let m = mgr(4);
        m.create_arena(1, 0x1000_0000);
        let free_before = m.page_allocator().free_pages_total();
        // Ask for more than the pool has; should fail and restore free count.
        assert!(m.sbrk(1, 64 * PAGE_SIZE as i64).is_err());
        assert_eq!(m.page_allocator().free_pages_total(), free_before);
        assert_eq!(m.arena_size(1).unwrap(), 0);
    }
}
