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

//! The buddy allocator serves page-granular allocations of `2^order` pages from
//! one of a handful of registered pools.
//!
//! A pool's free lists are intrusive, index-based, doubly-linked circular lists —
//! a block never holds a real pointer to its neighbours, only the index of its
//! neighbour in the pool's flat `blocks` array (spec §9's "port as indices, not
//! raw pointers"). A block's buddy at a given order is found with a single XOR:
//! `buddy_index = index ^ (1 << order)`, because buddy blocks are always aligned
//! to their own size.
//!
//! Two independent [`PageAllocator`] values exist in a running kernel: one over
//! PSRAM physical pages (backs task memory), one over the framebuffer virtual
//! address reservation. They share this code but never share state (spec §4.1).

use crate::error::{EResult, KernelError};
use crate::memory::{order_for_pages, pages_for, pages_in_order, PAGE_SIZE};
use std::sync::Mutex;

/// The maximum number of pools a single allocator can register (spec: "up to N pools").
pub const MAX_POOLS: usize = 4;

/// Tag describing what an allocation is for; carried on the block purely for
/// diagnostics (spec §4.1 `allocate(size, type, flags)`).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AllocKind {
    /// A task's demand-mapped heap pages.
    Task,
    /// Compositor scan-out / window framebuffer pages.
    Framebuffer,
    /// Kernel-internal allocation (tables, queues, ...).
    Kernel,
}

/// Allocator flags. Bit 0..1 select a zone the way `spec.md` describes
/// `FLAG_ZONE_TYPE_*`; unused zone bits are reserved for the real firmware's
/// MMIO/user/kernel split, which this substrate does not otherwise model.
pub type Flags = u32;

bitflags::bitflags! {
    /// Flags a pool is registered with.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct PoolFlags: u32 {
        /// Default pool with no special behavior.
        const NONE = 0;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum BlockState {
    /// On a free list at `order`.
    Free,
    /// On the waste list; never returned to a caller.
    Waste,
    /// Handed out to a caller, tagged with what it's for.
    Allocated(AllocKind),
}

/// One slot of the pool's flat block-metadata array, one per page.
///
/// Only the index whose page is the *start* of a block carries meaningful
/// `order`/`state`/`prev`/`next`; the other pages a multi-page block covers
/// are otherwise unused, mirroring the original firmware's per-page metadata
/// array (`buddy_block_t blocks[]`).
#[derive(Debug, Copy, Clone)]
struct Block {
    order: u8,
    state: BlockState,
    in_list: bool,
    prev: u32,
    next: u32,
}

impl Block {
    fn placeholder() -> Self {
        Self {
            order: 0,
            state: BlockState::Waste,
            in_list: false,
            prev: 0,
            next: 0,
        }
    }
}

/// A contiguous region of physical (or virtual, for the framebuffer allocator)
/// address space managed by the buddy algorithm.
struct Pool {
    start: u64,
    /// Real, usable pages (excludes the power-of-two padding tail).
    real_pages: u32,
    /// Total slots tracked, `1 << max_order`.
    total_slots: u32,
    max_order: u8,
    max_order_free: u8,
    free_pages: u32,
    blocks: Vec<Block>,
    /// `free_lists[order]` is the index of one block in that order's circular
    /// list, or `None` if the list is empty.
    free_lists: Vec<Option<u32>>,
    waste_list: Option<u32>,
    flags: PoolFlags,
}

impl Pool {
    fn new(start: u64, real_pages: u32, flags: PoolFlags) -> Self {
        let max_order = order_for_pages(real_pages.max(1) as usize);
        let total_slots = pages_in_order(max_order) as u32;
        let mut blocks = vec![Block::placeholder(); total_slots as usize];
        for (i, b) in blocks.iter_mut().enumerate() {
            b.state = if (i as u32) < real_pages {
                BlockState::Free
            } else {
                BlockState::Waste
            };
        }
        // The whole pool starts as a single free block at the top order, even
        // though its tail may be waste; waste is discovered lazily as we split.
        blocks[0].order = max_order;
        blocks[0].in_list = true;
        blocks[0].prev = 0;
        blocks[0].next = 0;
        let mut free_lists = vec![None; max_order as usize + 1];
        free_lists[max_order as usize] = Some(0);
        Self {
            start,
            real_pages,
            total_slots,
            max_order,
            max_order_free: max_order,
            free_pages: real_pages,
            blocks,
            free_lists,
            waste_list: None,
            flags,
        }
    }

    fn contains(&self, addr: u64) -> bool {
        let end = self.start + (self.total_slots as u64) * PAGE_SIZE as u64;
        addr >= self.start && addr < end
    }

    fn list_head_mut(&mut self, order: u8) -> &mut Option<u32> {
        &mut self.free_lists[order as usize]
    }

    /// Pushes `idx` to the back of the circular list rooted at `*head`.
    fn list_push_back(&mut self, head_order: Option<u8>, waste: bool, idx: u32) {
        self.blocks[idx as usize].in_list = true;
        let head = if waste {
            self.waste_list
        } else {
            self.free_lists[head_order.unwrap() as usize]
        };
        match head {
            None => {
                self.blocks[idx as usize].prev = idx;
                self.blocks[idx as usize].next = idx;
                if waste {
                    self.waste_list = Some(idx);
                } else {
                    self.free_lists[head_order.unwrap() as usize] = Some(idx);
                }
            }
            Some(head_idx) => {
                let tail_idx = self.blocks[head_idx as usize].prev;
                self.blocks[idx as usize].prev = tail_idx;
                self.blocks[idx as usize].next = head_idx;
                self.blocks[tail_idx as usize].next = idx;
                self.blocks[head_idx as usize].prev = idx;
            }
        }
    }

    /// Removes `idx` from whichever circular list it's linked into.
    fn list_remove(&mut self, waste: bool, order: u8, idx: u32) {
        let prev = self.blocks[idx as usize].prev;
        let next = self.blocks[idx as usize].next;
        self.blocks[idx as usize].in_list = false;
        if prev == idx && next == idx {
            if waste {
                self.waste_list = None;
            } else {
                *self.list_head_mut(order) = None;
            }
            return;
        }
        self.blocks[prev as usize].next = next;
        self.blocks[next as usize].prev = prev;
        let head = if waste {
            self.waste_list
        } else {
            self.free_lists[order as usize]
        };
        if head == Some(idx) {
            if waste {
                self.waste_list = Some(next);
            } else {
                self.free_lists[order as usize] = Some(next);
            }
        }
    }

    fn is_waste_block(&self, idx: u32) -> bool {
        matches!(self.blocks[idx as usize].state, BlockState::Waste)
    }

    /// Number of *real* (non-waste) pages covered by a block of `order` starting
    /// at `idx`. A block may straddle the real/waste boundary, so this is not
    /// always the full `2^order`.
    fn real_pages_in_block(&self, idx: u32, order: u8) -> u32 {
        let end = idx + pages_in_order(order) as u32;
        end.min(self.real_pages).saturating_sub(idx)
    }

    /// Finds a free block of order `>= order` whose first `request_pages` pages
    /// (starting at that block's index) are all real, not waste.
    fn find_block(&self, order: u8, request_pages: u32) -> Option<u32> {
        for o in order..=self.max_order {
            let Some(head) = self.free_lists[o as usize] else {
                continue;
            };
            let mut idx = head;
            loop {
                let last_used = idx + request_pages - 1;
                let overruns_waste = last_used >= self.total_slots || {
                    // A page beyond `real_pages` is waste by construction.
                    last_used >= self.real_pages
                };
                if !overruns_waste {
                    return Some(idx);
                }
                idx = self.blocks[idx as usize].next;
                if idx == head {
                    break;
                }
            }
        }
        None
    }

    /// Splits the block at `idx` (currently free, unlinked) down to `target_order`,
    /// pushing each right buddy onto the free or waste list as appropriate. `idx`
    /// itself is left unlinked; the caller marks it allocated.
    fn split_down(&mut self, idx: u32, target_order: u8) {
        while self.blocks[idx as usize].order > target_order {
            let cur_order = self.blocks[idx as usize].order;
            let new_order = cur_order - 1;
            self.blocks[idx as usize].order = new_order;
            let buddy_idx = idx ^ (1u32 << new_order);
            self.blocks[buddy_idx as usize].order = new_order;
            self.blocks[buddy_idx as usize].state = if self.is_waste_block(buddy_idx) {
                BlockState::Waste
            } else {
                BlockState::Free
            };
            let waste = self.is_waste_block(buddy_idx);
            self.list_push_back(Some(new_order), waste, buddy_idx);
        }
    }

    /// Recomputes `max_order_free` as the highest non-empty free list order.
    fn refresh_max_order_free(&mut self) {
        let mut order = self.max_order;
        loop {
            if self.free_lists[order as usize].is_some() {
                self.max_order_free = order;
                return;
            }
            if order == 0 {
                self.max_order_free = 0;
                return;
            }
            order -= 1;
        }
    }

    /// Coalesces the freed block at `idx`/`order` with free buddies, recursively,
    /// then links the final merged block.
    fn coalesce_and_link(&mut self, mut idx: u32, mut order: u8) {
        while order < self.max_order {
            let buddy_idx = idx ^ (1u32 << order);
            if buddy_idx >= self.total_slots {
                break;
            }
            let buddy = self.blocks[buddy_idx as usize];
            if buddy.order != order || !buddy.in_list || matches!(buddy.state, BlockState::Allocated(_))
            {
                break;
            }
            // A waste buddy is never merged with: once either half is waste, the
            // pair stays split so the waste accounting at this order is exact.
            if matches!(buddy.state, BlockState::Waste) {
                break;
            }
            self.list_remove(false, order, buddy_idx);
            idx = idx.min(buddy_idx);
            order += 1;
        }
        self.blocks[idx as usize].order = order;
        self.blocks[idx as usize].state = BlockState::Free;
        self.list_push_back(Some(order), false, idx);
        self.max_order_free = self.max_order_free.max(order);
    }
}

/// Physical or virtual page allocator over up to [`MAX_POOLS`] registered pools.
pub struct PageAllocator {
    pools: Mutex<Vec<Pool>>,
}

impl PageAllocator {
    /// Creates an allocator with no pools registered yet.
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(Vec::new()),
        }
    }

    /// Registers a pool covering `[start, end)` bytes of address space.
    ///
    /// Fails silently (returns `false`) if the pool count is already exhausted,
    /// matching spec §4.1.
    pub fn init_pool(&self, start: u64, end: u64, flags: PoolFlags) -> bool {
        let mut pools = self.pools.lock().unwrap();
        if pools.len() >= MAX_POOLS {
            log::warn!("init_pool: out of pools, discarding region at {start:#x}");
            return false;
        }
        let real_pages = ((end - start) / PAGE_SIZE as u64) as u32;
        pools.push(Pool::new(start, real_pages, flags));
        true
    }

    /// Allocates `size` bytes, rounded up to a page count and then to a power of
    /// two. Returns the base address of the allocation, or an error if no pool
    /// has a suitable block.
    pub fn allocate(&self, size: usize, kind: AllocKind, flags: Flags) -> EResult<u64> {
        if size == 0 {
            return Err(KernelError::InvalidArgument("allocate: zero-sized request"));
        }
        let pages = pages_for(size) as u32;
        let order = order_for_pages(pages as usize);
        let _ = flags;
        let mut pools = self.pools.lock().unwrap();
        for pool in pools.iter_mut() {
            if pool.max_order_free < order || pool.free_pages < pages {
                continue;
            }
            let Some(idx) = pool.find_block(order, pages) else {
                continue;
            };
            pool.list_remove(false, pool.blocks[idx as usize].order, idx);
            pool.split_down(idx, order);
            pool.blocks[idx as usize].order = order;
            pool.blocks[idx as usize].state = BlockState::Allocated(kind);
            pool.refresh_max_order_free();
            pool.free_pages -= pool.real_pages_in_block(idx, order);
            return Ok(pool.start + idx as u64 * PAGE_SIZE as u64);
        }
        Err(KernelError::ResourceExhaustion("buddy allocator: no suitable block"))
    }

    /// Frees an allocation previously returned by [`allocate`](Self::allocate).
    ///
    /// `ptr` must be page-aligned and must be a live allocation; violating
    /// either is a fatal contract violation (spec §4.1).
    pub fn deallocate(&self, ptr: u64) -> EResult<()> {
        if ptr % PAGE_SIZE as u64 != 0 {
            return Err(KernelError::ContractViolation("deallocate: pointer not page-aligned"));
        }
        let mut pools = self.pools.lock().unwrap();
        let Some(pool) = pools.iter_mut().find(|p| p.contains(ptr)) else {
            return Err(KernelError::InvalidArgument("deallocate: pointer not in any pool"));
        };
        let idx = ((ptr - pool.start) / PAGE_SIZE as u64) as u32;
        let order = match pool.blocks[idx as usize].state {
            BlockState::Allocated(_) => pool.blocks[idx as usize].order,
            _ => return Err(KernelError::ContractViolation("double free of buddy allocation")),
        };
        pool.free_pages += pool.real_pages_in_block(idx, order);
        pool.coalesce_and_link(idx, order);
        Ok(())
    }

    /// Total free pages across every registered pool (excludes waste).
    pub fn free_pages_total(&self) -> usize {
        self.pools.lock().unwrap().iter().map(|p| p.free_pages as usize).sum()
    }

    /// Total real (non-waste) pages across every registered pool.
    pub fn total_pages(&self) -> usize {
        self.pools.lock().unwrap().iter().map(|p| p.real_pages as usize).sum()
    }

    /// Number of pools currently registered. Exposed for tests and diagnostics.
    pub fn pool_count(&self) -> usize {
        self.pools.lock().unwrap().len()
    }
}

impl Default for PageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_allocator(pages: u32) -> PageAllocator {
        let a = PageAllocator::new();
        assert!(a.init_pool(0, pages as u64 * PAGE_SIZE as u64, PoolFlags::NONE));
        a
    }

    #[test]
    fn round_trips_same_footprint() {
        let a = small_allocator(64);
        let free_before = a.free_pages_total();
        let p = a.allocate(PAGE_SIZE * 3, AllocKind::Task, 0).unwrap();
        assert_eq!(p % PAGE_SIZE as u64, 0);
        a.deallocate(p).unwrap();
        assert_eq!(a.free_pages_total(), free_before);
    }

    #[test]
    fn disjoint_live_allocations() {
        let a = small_allocator(64);
        let p1 = a.allocate(PAGE_SIZE, AllocKind::Task, 0).unwrap();
        let p2 = a.allocate(PAGE_SIZE, AllocKind::Task, 0).unwrap();
        assert_ne!(p1, p2);
        let order_pages = pages_in_order(order_for_pages(1)) as u64 * PAGE_SIZE as u64;
        assert!(p1 + order_pages <= p2 || p2 + order_pages <= p1);
    }

    #[test]
    fn exhaustion_returns_error_not_panic() {
        let a = small_allocator(4);
        // Whole pool is one order-2 block; this should succeed...
        let p = a.allocate(4 * PAGE_SIZE, AllocKind::Task, 0).unwrap();
        // ...and now the pool is full.
        assert!(a.allocate(PAGE_SIZE, AllocKind::Task, 0).is_err());
        a.deallocate(p).unwrap();
        assert!(a.allocate(4 * PAGE_SIZE, AllocKind::Task, 0).is_ok());
    }

    #[test]
    fn double_free_is_a_contract_violation() {
        let a = small_allocator(8);
        let p = a.allocate(PAGE_SIZE, AllocKind::Task, 0).unwrap();
        a.deallocate(p).unwrap();
        assert!(matches!(a.deallocate(p), Err(KernelError::ContractViolation(_))));
    }

    #[test]
    fn misaligned_pointer_is_rejected() {
        let a = small_allocator(8);
        assert!(matches!(
            a.deallocate(1),
            Err(KernelError::ContractViolation(_))
        ));
    }

    #[test]
    fn waste_pages_are_never_returned() {
        // 5 pages rounds up to an order-3 (8 slot) pool; 3 pages are waste.
        let a = small_allocator(5);
        assert_eq!(a.total_pages(), 5);
        // Allocating all 5 usable pages should succeed...
        let p = a.allocate(5 * PAGE_SIZE, AllocKind::Task, 0).unwrap();
        // ...but nothing more fits, because the rest is waste, not free.
        assert!(a.allocate(PAGE_SIZE, AllocKind::Task, 0).is_err());
        a.deallocate(p).unwrap();
    }

    #[test]
    fn max_order_free_tracks_highest_nonempty_list() {
        let a = small_allocator(64);
        let pools = a.pools.lock().unwrap();
        assert_eq!(pools[0].max_order_free, pools[0].max_order);
        drop(pools);
        let p = a.allocate(PAGE_SIZE, AllocKind::Task, 0).unwrap();
        {
            let pools = a.pools.lock().unwrap();
            assert!(pools[0].max_order_free < pools[0].max_order);
        }
        a.deallocate(p).unwrap();
        let pools = a.pools.lock().unwrap();
        assert_eq!(pools[0].max_order_free, pools[0].max_order);
    }

    #[test]
    fn free_lists_contain_no_free_buddy_pair() {
        let a = small_allocator(32);
        // Force a few splits by taking a small allocation, then verify no two
        // free blocks at the same order are buddies of each other.
        let _keep = a.allocate(PAGE_SIZE, AllocKind::Task, 0).unwrap();
        let pools = a.pools.lock().unwrap();
        let pool = &pools[0];
        for (order, head) in pool.free_lists.iter().enumerate() {
            let Some(head) = *head else { continue };
            let mut idx = head;
            loop {
                let buddy = idx ^ (1u32 << order);
                if (buddy as usize) < pool.blocks.len() {
                    let is_free_same_order =
                        pool.blocks[buddy as usize].in_list && pool.blocks[buddy as usize].order == order as u8;
                    assert!(
                        !is_free_same_order,
                        "block {idx} and its buddy {buddy} are both free at order {order}"
                    );
                }
                idx = pool.blocks[idx as usize].next;
                if idx == head {
                    break;
                }
            }
        }
    }
}
