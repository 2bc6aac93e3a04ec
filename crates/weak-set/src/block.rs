//! Weak blocks: fixed-capacity arenas of weak handle slots.
//!
//! A block owns `WEAK_BLOCK_CAPACITY` slots. Unused slots form an intrusive
//! free list threaded through the slots themselves, and two bitmaps track
//! which slots hold live handles and which hold cleared handles waiting for
//! sweep. Blocks are linked into exactly one [`WeakSet`](crate::WeakSet).

use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::bitmap::SlotBitmap;
use crate::handle::{WeakHandle, WeakHandleOwner, WeakImpl, WeakState};
use crate::heap::{HeapRef, Liveness, MarkVisitor, WeakContext};
use crate::provider::BlockProvider;

/// Handle slots per block.
pub const WEAK_BLOCK_CAPACITY: usize = 64;

static NEXT_BLOCK_EPOCH: AtomicU64 = AtomicU64::new(1);

enum SlotEntry {
    Free { next_free: Option<u32> },
    Used(WeakImpl),
}

struct Slot {
    generation: u32,
    entry: SlotEntry,
}

/// What one block's sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepResult {
    /// Owner callbacks run.
    pub finalized: usize,
    /// Slots returned to the free list.
    pub recycled: usize,
    /// Free slots after the sweep.
    pub free_cells: usize,
    /// The block holds no handles at all after the sweep.
    pub block_is_free: bool,
}

impl SweepResult {
    /// The block holds no handle after this sweep.
    #[must_use]
    pub const fn is_free_block(&self) -> bool {
        self.block_is_free
    }

    /// At least one slot is free after this sweep.
    #[must_use]
    pub const fn has_free_cells(&self) -> bool {
        self.free_cells > 0
    }
}

/// A fixed-size arena of weak handle slots.
pub struct WeakBlock {
    epoch: u64,
    slots: [Slot; WEAK_BLOCK_CAPACITY],
    free_head: Option<u32>,
    used: usize,
    live: SlotBitmap,
    pending: SlotBitmap,
    prev: Option<NonNull<WeakBlock>>,
    next: Option<NonNull<WeakBlock>>,
}

impl WeakBlock {
    /// Storage layout requested from the block provider.
    pub const LAYOUT: Layout = Layout::new::<Self>();

    fn new() -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let slots = std::array::from_fn(|i| Slot {
            generation: 0,
            entry: SlotEntry::Free {
                next_free: (i + 1 < WEAK_BLOCK_CAPACITY).then_some((i + 1) as u32),
            },
        });
        Self {
            epoch: NEXT_BLOCK_EPOCH.fetch_add(1, Ordering::Relaxed),
            slots,
            free_head: Some(0),
            used: 0,
            live: SlotBitmap::new(),
            pending: SlotBitmap::new(),
            prev: None,
            next: None,
        }
    }

    /// Builds an empty block in storage from `provider`.
    pub(crate) fn create(provider: &dyn BlockProvider) -> NonNull<Self> {
        let ptr = provider.allocate_block(Self::LAYOUT).cast::<Self>();
        // SAFETY: the provider returned writable storage for `LAYOUT`.
        unsafe { ptr.as_ptr().write(Self::new()) };
        ptr
    }

    /// Drops the block in place and gives its storage back.
    ///
    /// Owners of handles still in the block are not called.
    ///
    /// # Safety
    ///
    /// `block` must come from `create` with the same provider, must be
    /// unlinked, and must not be used afterwards.
    pub(crate) unsafe fn destroy(block: NonNull<Self>, provider: &dyn BlockProvider) {
        unsafe {
            std::ptr::drop_in_place(block.as_ptr());
            provider.release_block(block.cast::<u8>(), Self::LAYOUT);
        }
    }

    /// Process-wide unique id of this block, stamped into its handles.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// No slot is in use.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Slots holding a handle in any state.
    #[must_use]
    pub const fn used_count(&self) -> usize {
        self.used
    }

    /// Slots holding a handle whose target is still alive.
    #[must_use]
    pub const fn live_count(&self) -> usize {
        self.live.count()
    }

    /// Slots holding a cleared handle waiting for sweep.
    #[must_use]
    pub const fn pending_count(&self) -> usize {
        self.pending.count()
    }

    /// Slots on the free list.
    #[must_use]
    pub const fn free_count(&self) -> usize {
        WEAK_BLOCK_CAPACITY - self.used
    }

    /// The free list is not exhausted.
    #[must_use]
    pub const fn has_free_cells(&self) -> bool {
        self.free_head.is_some()
    }

    pub(crate) const fn prev(&self) -> Option<NonNull<Self>> {
        self.prev
    }

    pub(crate) const fn next(&self) -> Option<NonNull<Self>> {
        self.next
    }

    pub(crate) fn set_prev(&mut self, prev: Option<NonNull<Self>>) {
        self.prev = prev;
    }

    pub(crate) fn set_next(&mut self, next: Option<NonNull<Self>>) {
        self.next = next;
    }

    /// Claims the head of the free list.
    ///
    /// `this` must be the address of `self`; it becomes the handle's block.
    pub(crate) fn allocate(
        &mut self,
        this: NonNull<Self>,
        target: HeapRef,
        owner: Option<Arc<dyn WeakHandleOwner>>,
        context: WeakContext,
    ) -> Option<WeakHandle> {
        let index = self.free_head?;
        let slot = &mut self.slots[index as usize];
        let SlotEntry::Free { next_free } = slot.entry else {
            unreachable!("weak block free list points at an occupied slot");
        };
        self.free_head = next_free;

        slot.generation = slot.generation.wrapping_add(1);
        if slot.generation == 0 {
            slot.generation = 1;
        }
        slot.entry = SlotEntry::Used(WeakImpl::new(target, owner, context));

        self.used += 1;
        self.live.set(index as usize);
        Some(WeakHandle::new(this, self.epoch, index, slot.generation))
    }

    /// The record behind `handle`, if the handle is still current.
    pub(crate) fn record(&self, handle: WeakHandle) -> Option<&WeakImpl> {
        if handle.epoch() != self.epoch {
            return None;
        }
        let slot = self.slots.get(handle.index())?;
        match &slot.entry {
            SlotEntry::Used(record) if slot.generation == handle.generation() => Some(record),
            _ => None,
        }
    }

    /// Explicit release: clears the target and frees the slot now.
    ///
    /// # Panics
    ///
    /// Panics if the handle was already deallocated or swept.
    pub(crate) fn deallocate(&mut self, handle: WeakHandle) {
        assert!(
            self.record(handle).is_some(),
            "weak handle {handle:?} deallocated twice or after its slot was swept"
        );
        self.release(handle.index());
    }

    #[allow(clippy::cast_possible_truncation)]
    fn release(&mut self, index: usize) {
        // Dropping the old record drops any owner that was never called.
        let previous = std::mem::replace(
            &mut self.slots[index].entry,
            SlotEntry::Free {
                next_free: self.free_head,
            },
        );
        debug_assert!(matches!(previous, SlotEntry::Used(_)));
        self.free_head = Some(index as u32);
        self.used -= 1;
        self.live.unset(index);
        self.pending.unset(index);
    }

    fn used_record_mut(&mut self, index: usize) -> &mut WeakImpl {
        match &mut self.slots[index].entry {
            SlotEntry::Used(record) => record,
            SlotEntry::Free { .. } => unreachable!("weak block bitmap marks a free slot"),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn handle_at(&self, this: NonNull<Self>, index: usize) -> WeakHandle {
        WeakHandle::new(this, self.epoch, index as u32, self.slots[index].generation)
    }

    /// Lets owners keep unmarked targets alive through opaque roots.
    ///
    /// Returns how many targets were marked.
    pub(crate) fn visit(&mut self, this: NonNull<Self>, visitor: &mut dyn MarkVisitor) -> usize {
        let mut kept = 0;
        for index in self.live.clone().iter() {
            let handle = self.handle_at(this, index);
            let record = self.used_record_mut(index);
            let (Some(target), Some(owner)) = (record.target, record.owner.clone()) else {
                continue;
            };
            if visitor.is_marked(target) {
                continue;
            }
            if owner.is_reachable_from_opaque_roots(handle, record.context, visitor) {
                visitor.mark(target);
                kept += 1;
            }
        }
        kept
    }

    /// Clears every live handle whose target was not marked.
    ///
    /// Returns how many handles were cleared. No owner is called.
    pub(crate) fn reap(&mut self, liveness: &dyn Liveness) -> usize {
        let mut reaped = 0;
        for index in self.live.clone().iter() {
            let record = self.used_record_mut(index);
            let marked = record.target.is_some_and(|t| liveness.is_marked(t));
            if !marked {
                record.kill();
                self.live.unset(index);
                self.pending.set(index);
                reaped += 1;
            }
        }
        reaped
    }

    /// Finalizes cleared handles and returns their slots to the free list.
    pub(crate) fn sweep(&mut self, this: NonNull<Self>) -> SweepResult {
        let mut result = SweepResult::default();
        if !self.pending.is_clear() {
            for index in self.pending.clone().iter() {
                let handle = self.handle_at(this, index);
                let record = self.used_record_mut(index);
                debug_assert_ne!(record.state, WeakState::Live);
                if record.finalize(handle) {
                    result.finalized += 1;
                }
                self.release(index);
                result.recycled += 1;
            }
        }
        result.free_cells = self.free_count();
        result.block_is_free = self.is_empty();
        result
    }

    /// Teardown: treats every remaining handle as dead and finalizes it.
    ///
    /// Slots stay occupied (as `Finalized`) until swept or the block is
    /// destroyed. Returns how many owners were called.
    pub(crate) fn last_chance_to_finalize(&mut self, this: NonNull<Self>) -> usize {
        for index in self.live.clone().iter() {
            self.used_record_mut(index).kill();
            self.live.unset(index);
            self.pending.set(index);
        }

        let mut finalized = 0;
        for index in self.pending.clone().iter() {
            let handle = self.handle_at(this, index);
            if self.used_record_mut(index).finalize(handle) {
                finalized += 1;
            }
        }
        finalized
    }

    /// Calls `f` with every occupied slot's handle, state and target.
    pub(crate) fn for_each_handle<F>(&self, this: NonNull<Self>, mut f: F)
    where
        F: FnMut(WeakHandle, WeakState, Option<HeapRef>),
    {
        for (index, slot) in self.slots.iter().enumerate() {
            if let SlotEntry::Used(record) = &slot.entry {
                f(self.handle_at(this, index), record.state, record.target);
            }
        }
    }
}

impl fmt::Debug for WeakBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakBlock")
            .field("used", &self.used)
            .field("live", &self.live.count())
            .field("pending", &self.pending.count())
            .field("free_head", &self.free_head)
            .finish_non_exhaustive()
    }
}
