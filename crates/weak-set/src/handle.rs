//! Weak handles and the owner callback protocol.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::block::WeakBlock;
use crate::heap::{HeapRef, MarkVisitor, WeakContext};

/// Capability registered with a weak handle to hear about its target's death.
///
/// Owners run on the collector thread with the owning weak set locked, so an
/// owner must not allocate into, or deallocate from, the set that is calling
/// it, and must not resurrect the dead target.
pub trait WeakHandleOwner: Send + Sync {
    /// Asked while weak sets are visited during marking, for handles whose
    /// target has not been marked yet. Returning `true` keeps the target
    /// alive for this cycle.
    fn is_reachable_from_opaque_roots(
        &self,
        handle: WeakHandle,
        context: WeakContext,
        visitor: &mut dyn MarkVisitor,
    ) -> bool {
        let _ = (handle, context, visitor);
        false
    }

    /// Called exactly once after the handle's target was found dead, before
    /// the handle's slot is reused.
    fn finalize(&self, handle: WeakHandle, context: WeakContext);
}

impl<F> WeakHandleOwner for F
where
    F: Fn(WeakHandle, WeakContext) + Send + Sync,
{
    fn finalize(&self, handle: WeakHandle, context: WeakContext) {
        self(handle, context);
    }
}

/// Where a handle is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeakState {
    /// The target is alive (as of the last reap).
    Live,
    /// Reap cleared the target; sweep will finalize and recycle the slot.
    Dead,
    /// Teardown already finalized the handle; only storage remains.
    Finalized,
}

/// A weak reference: a non-owning pointer to one slot of one weak block.
///
/// Handles are plain tokens. Reading through one goes through the owning
/// [`WeakSet`](crate::WeakSet), which finds the block by its epoch and checks
/// that the slot still belongs to this handle's generation. Epochs are never
/// reused, so a handle into a released block stays stale even if a later
/// block lands at the same address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeakHandle {
    block: NonNull<WeakBlock>,
    epoch: u64,
    index: u32,
    generation: u32,
}

impl WeakHandle {
    pub(crate) const fn new(
        block: NonNull<WeakBlock>,
        epoch: u64,
        index: u32,
        generation: u32,
    ) -> Self {
        Self {
            block,
            epoch,
            index,
            generation,
        }
    }

    /// Epoch of the block the handle was issued from.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Identity of the block the handle lives in. Only compared, never
    /// dereferenced.
    pub(crate) const fn block(&self) -> NonNull<WeakBlock> {
        self.block
    }

    /// Slot index inside its block.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index as usize
    }

    /// Allocation generation of the slot when this handle was issued.
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for WeakHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakHandle")
            .field("block", &self.block.as_ptr())
            .field("epoch", &self.epoch)
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

// SAFETY: a handle is an inert token; the block pointer is never dereferenced
// through the handle itself.
unsafe impl Send for WeakHandle {}
unsafe impl Sync for WeakHandle {}

/// The record stored in an occupied slot.
pub(crate) struct WeakImpl {
    pub(crate) target: Option<HeapRef>,
    pub(crate) owner: Option<Arc<dyn WeakHandleOwner>>,
    pub(crate) context: WeakContext,
    pub(crate) state: WeakState,
}

impl WeakImpl {
    pub(crate) fn new(
        target: HeapRef,
        owner: Option<Arc<dyn WeakHandleOwner>>,
        context: WeakContext,
    ) -> Self {
        Self {
            target: Some(target),
            owner,
            context,
            state: WeakState::Live,
        }
    }

    /// Clears the target, leaving the owner to be finalized by sweep.
    pub(crate) fn kill(&mut self) {
        self.target = None;
        self.state = WeakState::Dead;
    }

    /// Runs the owner's finalizer if it has not run yet.
    ///
    /// The owner is taken out of the record before the call so a second
    /// invocation finds nothing to run.
    pub(crate) fn finalize(&mut self, handle: WeakHandle) -> bool {
        self.target = None;
        self.state = WeakState::Finalized;
        match self.owner.take() {
            Some(owner) => {
                owner.finalize(handle, self.context);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for WeakImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakImpl")
            .field("target", &self.target)
            .field("has_owner", &self.owner.is_some())
            .field("context", &self.context)
            .field("state", &self.state)
            .finish()
    }
}
