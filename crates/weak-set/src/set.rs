//! Weak sets: per-owner collections of weak blocks.
//!
//! A [`WeakSet`] hands out [`WeakHandle`]s from a doubly linked list of
//! [`WeakBlock`]s and implements the collector's side of weak references:
//!
//! 1. [`reap`](WeakSet::reap) clears handles whose target was not marked,
//!    without calling anyone.
//! 2. [`sweep`](WeakSet::sweep) runs each cleared handle's owner once and
//!    recycles the slot.
//! 3. [`shrink`](WeakSet::shrink) gives empty blocks back to the provider.
//!
//! Reap must finish for every set in the heap before any set is swept; see
//! [`ActiveWeakSets`](crate::ActiveWeakSets) for a driver that enforces it.

use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::block::{SweepResult, WeakBlock};
use crate::gate::PhaseGate;
use crate::handle::{WeakHandle, WeakHandleOwner, WeakState};
use crate::heap::{HeapRef, Liveness, MarkVisitor, WeakContext};
use crate::metrics::WeakSetStats;
use crate::provider::{BlockProvider, SystemBlockProvider};

#[cfg(feature = "tracing")]
use crate::tracing::internal::{log_block_created, log_block_released};

/// Weak handles for one heap-associated owner.
pub struct WeakSet {
    head: Option<NonNull<WeakBlock>>,
    /// Linked blocks by epoch, for handle lookups.
    blocks: HashMap<u64, NonNull<WeakBlock>>,
    /// Block currently serving allocations.
    allocator: Option<NonNull<WeakBlock>>,
    /// Next block to try once `allocator` runs dry.
    next_allocator: Option<NonNull<WeakBlock>>,
    provider: Arc<dyn BlockProvider>,
    on_list: bool,
    stats: WeakSetStats,
}

impl WeakSet {
    /// An empty set drawing blocks from the global allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::with_provider(Arc::new(SystemBlockProvider::new()))
    }

    /// An empty set drawing blocks from `provider`.
    #[must_use]
    pub fn with_provider(provider: Arc<dyn BlockProvider>) -> Self {
        Self {
            head: None,
            blocks: HashMap::new(),
            allocator: None,
            next_allocator: None,
            provider,
            on_list: false,
            stats: WeakSetStats::default(),
        }
    }

    /// The provider this set takes blocks from.
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn BlockProvider> {
        &self.provider
    }

    /// Creates a weak handle to `target`.
    ///
    /// `target` must be live when this is called; nothing here checks.
    ///
    /// # Panics
    ///
    /// Panics if `gate` is not in the mutator phase.
    pub fn allocate(
        &mut self,
        gate: &PhaseGate,
        target: HeapRef,
        owner: Option<Arc<dyn WeakHandleOwner>>,
        context: WeakContext,
    ) -> WeakHandle {
        gate.assert_mutator("allocate");

        // SAFETY: `allocator` and every block the search returns are linked
        // into this set, and `&mut self` gives exclusive access to them.
        let mut block = match self.allocator {
            Some(block) if unsafe { block.as_ref().has_free_cells() } => block,
            _ => self.find_allocator(),
        };
        let handle = unsafe { block.as_mut().allocate(block, target, owner, context) }
            .unwrap_or_else(|| unreachable!("weak allocator block has no free cell"));
        self.allocator = Some(block);
        self.stats.handles_allocated += 1;
        handle
    }

    /// Releases `handle` now: clears its target and frees its slot without
    /// calling its owner.
    ///
    /// # Panics
    ///
    /// Panics if `gate` is not in the mutator phase, if `handle` belongs to
    /// another set or to a block shrink already released, or if it was
    /// already deallocated or swept.
    pub fn deallocate(&mut self, gate: &PhaseGate, handle: WeakHandle) {
        gate.assert_mutator("deallocate");
        let Some(mut block) = self.find_block(handle) else {
            panic!(
                "weak handle {handle:?} does not belong to this weak set or its block was released"
            );
        };
        // SAFETY: `find_block` only returns blocks linked into this set.
        unsafe { block.as_mut().deallocate(handle) };
        self.stats.handles_deallocated += 1;
    }

    /// The handle's target, or `None` once it was cleared or the handle is
    /// stale.
    #[must_use]
    pub fn get(&self, handle: WeakHandle) -> Option<HeapRef> {
        self.with_record(handle, |record| record.target).flatten()
    }

    /// The handle's state, or `None` if the handle is stale or foreign.
    #[must_use]
    pub fn state(&self, handle: WeakHandle) -> Option<WeakState> {
        self.with_record(handle, |record| record.state)
    }

    /// The context the handle was registered with.
    #[must_use]
    pub fn context(&self, handle: WeakHandle) -> Option<WeakContext> {
        self.with_record(handle, |record| record.context)
    }

    /// Whether `handle` is a current handle of this set.
    #[must_use]
    pub fn contains(&self, handle: WeakHandle) -> bool {
        self.with_record(handle, |_| ()).is_some()
    }

    /// Weak visiting during marking.
    ///
    /// Offers every live, owned, not-yet-marked handle to its owner's
    /// opaque-root check and marks the targets owners vouch for. Returns how
    /// many targets were marked, so the marker can repeat until nothing
    /// changes.
    pub fn visit(&mut self, visitor: &mut dyn MarkVisitor) -> usize {
        let mut kept = 0;
        self.for_each_block_mut(|block, this| kept += block.visit(this, visitor));
        kept
    }

    /// Clears every handle whose target was not marked this cycle.
    ///
    /// Returns how many handles were cleared. No owner is called.
    pub fn reap(&mut self, liveness: &dyn Liveness) -> usize {
        let mut reaped = 0;
        self.for_each_block_mut(|block, _| reaped += block.reap(liveness));
        self.stats.handles_reaped += reaped;
        reaped
    }

    /// Runs each cleared handle's owner once and recycles the slots.
    ///
    /// Resets the allocator afterwards, so the next allocation rescans the
    /// block list from the head.
    pub fn sweep(&mut self) -> SweepResult {
        let mut total = SweepResult::default();
        self.for_each_block_mut(|block, this| {
            let result = block.sweep(this);
            total.finalized += result.finalized;
            total.recycled += result.recycled;
            total.free_cells += result.free_cells;
        });
        total.block_is_free = self.is_empty();
        self.stats.handles_finalized += total.finalized;
        self.reset_allocator();
        total
    }

    /// Releases every empty block except the current allocation target.
    ///
    /// Returns how many blocks were released.
    pub fn shrink(&mut self) -> usize {
        let mut released = 0;
        let mut cursor = self.head;
        while let Some(block) = cursor {
            // SAFETY: `block` is linked into this set.
            let (next, empty) = unsafe {
                let b = block.as_ref();
                (b.next(), b.is_empty())
            };
            if empty && self.allocator != Some(block) {
                self.remove_block(block);
                released += 1;
            }
            cursor = next;
        }
        self.stats.blocks_released += released;
        released
    }

    /// Heap teardown: finalizes every remaining handle as if reap had found
    /// its target dead.
    ///
    /// Each owner still runs at most once, even across repeated calls.
    /// Returns how many owners were called.
    pub fn last_chance_to_finalize(&mut self) -> usize {
        let mut finalized = 0;
        self.for_each_block_mut(|block, this| {
            finalized += block.last_chance_to_finalize(this);
        });
        self.stats.handles_finalized += finalized;
        finalized
    }

    /// Drops the cached allocation cursor; the next allocation scans the
    /// block list from the head.
    pub fn reset_allocator(&mut self) {
        self.allocator = None;
        self.next_allocator = self.head;
    }

    /// No block holds a handle.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let mut empty = true;
        self.for_each_block(|block| empty &= block.is_empty());
        empty
    }

    /// No blocks and not on a tracking list: the collector can skip this
    /// set entirely.
    #[must_use]
    pub const fn is_trivially_destructible(&self) -> bool {
        self.head.is_none() && !self.on_list
    }

    /// Whether this set is linked into a tracking list.
    #[must_use]
    pub const fn is_on_list(&self) -> bool {
        self.on_list
    }

    pub(crate) fn set_on_list(&mut self, on_list: bool) {
        self.on_list = on_list;
    }

    /// Blocks currently linked into the set.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Handles in any state, across all blocks.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        let mut count = 0;
        self.for_each_block(|block| count += block.used_count());
        count
    }

    /// Lifetime counters for this set.
    #[must_use]
    pub const fn stats(&self) -> WeakSetStats {
        self.stats
    }

    /// The first block of the list.
    #[must_use]
    pub fn head(&self) -> Option<&WeakBlock> {
        // SAFETY: linked blocks live as long as the set.
        self.head.map(|block| unsafe { &*block.as_ptr() })
    }

    /// Calls `f` with each block, head to tail.
    pub fn for_each_block<F>(&self, mut f: F)
    where
        F: FnMut(&WeakBlock),
    {
        let mut cursor = self.head;
        while let Some(block) = cursor {
            // SAFETY: linked blocks live as long as the set.
            let block = unsafe { block.as_ref() };
            cursor = block.next();
            f(block);
        }
    }

    /// Calls `f` with every handle in the set, head block first.
    pub fn for_each_handle<F>(&self, mut f: F)
    where
        F: FnMut(WeakHandle, WeakState, Option<HeapRef>),
    {
        let mut cursor = self.head;
        while let Some(block) = cursor {
            // SAFETY: linked blocks live as long as the set.
            let b = unsafe { block.as_ref() };
            b.for_each_handle(block, &mut f);
            cursor = b.next();
        }
    }

    fn for_each_block_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut WeakBlock, NonNull<WeakBlock>),
    {
        let mut cursor = self.head;
        while let Some(mut block) = cursor {
            // SAFETY: linked blocks live as long as the set and `&mut self`
            // makes this the only access.
            let b = unsafe { block.as_mut() };
            cursor = b.next();
            f(b, block);
        }
    }

    fn find_block(&self, handle: WeakHandle) -> Option<NonNull<WeakBlock>> {
        let block = *self.blocks.get(&handle.epoch())?;
        debug_assert_eq!(block, handle.block());
        Some(block)
    }

    fn with_record<R>(
        &self,
        handle: WeakHandle,
        f: impl FnOnce(&crate::handle::WeakImpl) -> R,
    ) -> Option<R> {
        let block = self.find_block(handle)?;
        // SAFETY: `find_block` only returns blocks linked into this set.
        unsafe { block.as_ref() }.record(handle).map(f)
    }

    /// Finds a block with a free cell, creating one if none has room.
    fn find_allocator(&mut self) -> NonNull<WeakBlock> {
        self.try_find_allocator()
            .unwrap_or_else(|| self.add_allocator())
    }

    /// Walks forward from `next_allocator` looking for free cells.
    fn try_find_allocator(&mut self) -> Option<NonNull<WeakBlock>> {
        while let Some(block) = self.next_allocator {
            // SAFETY: `next_allocator` is always null or linked into this set.
            let b = unsafe { block.as_ref() };
            self.next_allocator = b.next();
            if b.has_free_cells() {
                return Some(block);
            }
        }
        None
    }

    /// Creates a block and links it at the head of the list.
    fn add_allocator(&mut self) -> NonNull<WeakBlock> {
        let mut block = WeakBlock::create(self.provider.as_ref());
        // SAFETY: `block` is fresh and `head` is linked into this set.
        unsafe {
            block.as_mut().set_next(self.head);
            if let Some(mut old_head) = self.head {
                old_head.as_mut().set_prev(Some(block));
            }
        }
        self.head = Some(block);
        // SAFETY: `block` was just initialized.
        let epoch = unsafe { block.as_ref().epoch() };
        self.blocks.insert(epoch, block);
        self.stats.blocks_created += 1;

        #[cfg(feature = "tracing")]
        log_block_created(self.blocks.len());

        block
    }

    /// Unlinks `block`, fixes the allocator cursors, and destroys it.
    fn remove_block(&mut self, block: NonNull<WeakBlock>) {
        // SAFETY: `block` is linked into this set; its neighbours are too.
        let (prev, next, epoch) = unsafe {
            let b = block.as_ref();
            (b.prev(), b.next(), b.epoch())
        };
        unsafe {
            match prev {
                Some(mut p) => p.as_mut().set_next(next),
                None => self.head = next,
            }
            if let Some(mut n) = next {
                n.as_mut().set_prev(prev);
            }
        }

        if self.allocator == Some(block) {
            self.allocator = None;
        }
        if self.next_allocator == Some(block) {
            self.next_allocator = next;
        }
        self.blocks.remove(&epoch);

        // SAFETY: the block is unlinked and nothing refers to it any more.
        unsafe { WeakBlock::destroy(block, self.provider.as_ref()) };

        #[cfg(feature = "tracing")]
        log_block_released(self.blocks.len());
    }
}

impl Default for WeakSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WeakSet {
    fn drop(&mut self) {
        self.blocks.clear();
        let mut cursor = self.head.take();
        while let Some(block) = cursor {
            // SAFETY: every linked block came from `self.provider` and is
            // destroyed exactly once here.
            unsafe {
                cursor = block.as_ref().next();
                WeakBlock::destroy(block, self.provider.as_ref());
            }
        }
        self.allocator = None;
        self.next_allocator = None;
    }
}

impl fmt::Debug for WeakSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakSet")
            .field("blocks", &self.blocks.len())
            .field("handles", &self.handle_count())
            .field("on_list", &self.on_list)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

// SAFETY: the set exclusively owns its blocks; owners stored in them are
// `Send + Sync`, and cross-thread access is serialized by `&mut self`.
unsafe impl Send for WeakSet {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::WEAK_BLOCK_CAPACITY;
    use crate::heap::MarkSet;

    fn addr(n: usize) -> HeapRef {
        HeapRef::new(0x1000 + n * 16).unwrap()
    }

    #[test]
    fn test_first_allocation_creates_block() {
        let gate = PhaseGate::new();
        let mut set = WeakSet::new();
        assert!(set.is_trivially_destructible());
        assert!(set.head().is_none());

        let handle = set.allocate(&gate, addr(0), None, WeakContext::NONE);
        assert_eq!(set.block_count(), 1);
        assert_eq!(set.get(handle), Some(addr(0)));
        assert_eq!(set.state(handle), Some(WeakState::Live));
        assert!(!set.is_trivially_destructible());
        assert_eq!(set.provider().live_blocks(), 1);
    }

    #[test]
    fn test_full_block_adds_new_block_at_head() {
        let gate = PhaseGate::new();
        let mut set = WeakSet::new();
        let first = set.allocate(&gate, addr(0), None, WeakContext::NONE);
        for i in 1..WEAK_BLOCK_CAPACITY {
            set.allocate(&gate, addr(i), None, WeakContext::NONE);
        }
        assert_eq!(set.block_count(), 1);

        let overflow = set.allocate(&gate, addr(999), None, WeakContext::NONE);
        assert_eq!(set.block_count(), 2);
        assert_ne!(overflow.block(), first.block());
        assert_eq!(set.head().map(WeakBlock::used_count), Some(1));
    }

    #[test]
    fn test_allocation_reuses_swept_block_before_growing() {
        let gate = PhaseGate::new();
        let mut set = WeakSet::new();
        for i in 0..WEAK_BLOCK_CAPACITY * 2 {
            set.allocate(&gate, addr(i), None, WeakContext::NONE);
        }
        assert_eq!(set.block_count(), 2);

        // Nothing survives; both blocks become free but stay linked.
        set.reap(&MarkSet::new());
        set.sweep();
        assert!(set.is_empty());
        assert_eq!(set.block_count(), 2);

        for i in 0..WEAK_BLOCK_CAPACITY * 2 {
            set.allocate(&gate, addr(i), None, WeakContext::NONE);
        }
        assert_eq!(set.block_count(), 2);
    }

    #[test]
    fn test_deallocate_frees_slot_immediately() {
        let gate = PhaseGate::new();
        let mut set = WeakSet::new();
        let handle = set.allocate(&gate, addr(1), None, WeakContext::new(5));
        assert_eq!(set.context(handle), Some(WeakContext::new(5)));

        set.deallocate(&gate, handle);
        assert!(set.is_empty());
        assert!(!set.contains(handle));
        assert_eq!(set.get(handle), None);
        assert_eq!(set.stats().handles_deallocated, 1);
    }

    #[test]
    #[should_panic(expected = "does not belong to this weak set")]
    fn test_deallocate_foreign_handle_panics() {
        let gate = PhaseGate::new();
        let mut a = WeakSet::new();
        let mut b = WeakSet::new();
        let handle = a.allocate(&gate, addr(1), None, WeakContext::NONE);
        b.allocate(&gate, addr(2), None, WeakContext::NONE);
        b.deallocate(&gate, handle);
    }

    #[test]
    fn test_shrink_spares_current_allocator() {
        let gate = PhaseGate::new();
        let mut set = WeakSet::new();
        let handle = set.allocate(&gate, addr(1), None, WeakContext::NONE);
        set.deallocate(&gate, handle);

        // The only block is still the allocation target.
        assert_eq!(set.shrink(), 0);
        assert_eq!(set.block_count(), 1);

        set.reset_allocator();
        assert_eq!(set.shrink(), 1);
        assert_eq!(set.block_count(), 0);
        assert!(set.head().is_none());
        assert_eq!(set.provider().live_blocks(), 0);
    }

    #[test]
    fn test_shrink_fixes_next_allocator() {
        let gate = PhaseGate::new();
        let mut set = WeakSet::new();
        let mut handles = Vec::new();
        for i in 0..WEAK_BLOCK_CAPACITY * 3 {
            handles.push(set.allocate(&gate, addr(i), None, WeakContext::NONE));
        }
        assert_eq!(set.block_count(), 3);

        // Empty the newest block, which sits at the head of the list.
        for &handle in &handles[WEAK_BLOCK_CAPACITY * 2..] {
            set.deallocate(&gate, handle);
        }
        set.reset_allocator();
        assert_eq!(set.shrink(), 1);
        assert_eq!(set.block_count(), 2);

        // The candidate cursor skipped past the released head; the remaining
        // blocks are full, so allocation grows the list again.
        set.allocate(&gate, addr(5000), None, WeakContext::NONE);
        assert_eq!(set.block_count(), 3);
        assert_eq!(set.head().map(WeakBlock::used_count), Some(1));
    }

    #[test]
    fn test_handle_from_released_block_stays_stale() {
        let gate = PhaseGate::new();
        let mut set = WeakSet::new();
        let old = set.allocate(&gate, addr(1), None, WeakContext::NONE);
        set.deallocate(&gate, old);
        set.reset_allocator();
        assert_eq!(set.shrink(), 1);

        // The new block may well sit at the old block's address.
        let new = set.allocate(&gate, addr(2), None, WeakContext::NONE);
        assert_ne!(new.epoch(), old.epoch());
        assert_ne!(new, old);
        assert_eq!(set.get(old), None);
        assert_eq!(set.state(old), None);
        assert!(!set.contains(old));
        assert_eq!(set.get(new), Some(addr(2)));
    }

    #[test]
    #[should_panic(expected = "its block was released")]
    fn test_deallocate_into_released_block_panics() {
        let gate = PhaseGate::new();
        let mut set = WeakSet::new();
        let old = set.allocate(&gate, addr(1), None, WeakContext::NONE);
        set.deallocate(&gate, old);
        set.reset_allocator();
        set.shrink();
        let _new = set.allocate(&gate, addr(2), None, WeakContext::NONE);
        set.deallocate(&gate, old);
    }

    #[test]
    fn test_for_each_handle_reports_states() {
        let gate = PhaseGate::new();
        let mut set = WeakSet::new();
        set.allocate(&gate, addr(1), None, WeakContext::NONE);
        set.allocate(&gate, addr(2), None, WeakContext::NONE);

        let marks: MarkSet = [addr(1)].into_iter().collect();
        set.reap(&marks);

        let mut seen = Vec::new();
        set.for_each_handle(|_, state, target| seen.push((state, target)));
        seen.sort_by_key(|(_, target)| target.map(HeapRef::addr));
        assert_eq!(
            seen,
            vec![(WeakState::Dead, None), (WeakState::Live, Some(addr(1)))]
        );
    }

    #[test]
    fn test_drop_releases_all_blocks() {
        let gate = PhaseGate::new();
        let provider: Arc<dyn BlockProvider> = Arc::new(SystemBlockProvider::new());
        {
            let mut set = WeakSet::with_provider(Arc::clone(&provider));
            for i in 0..WEAK_BLOCK_CAPACITY + 1 {
                set.allocate(&gate, addr(i), None, WeakContext::NONE);
            }
            assert_eq!(provider.live_blocks(), 2);
        }
        assert_eq!(provider.live_blocks(), 0);
    }
}
