//! Backing storage for weak blocks.
//!
//! Weak blocks do not come from the general object heap. A [`BlockProvider`]
//! hands out raw, fixed-layout storage for one block at a time and takes it
//! back when `shrink` releases the block. Failing to supply storage is fatal:
//! providers report it through [`std::alloc::handle_alloc_error`].

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use sys_alloc::Region;

/// Source of block storage.
///
/// # Safety
///
/// `allocate_block` must return memory valid for reads and writes of
/// `layout.size()` bytes, aligned to `layout.align()`, and not handed out
/// again until it is passed back to `release_block`.
pub unsafe trait BlockProvider: Send + Sync {
    /// Returns storage for one block. Never returns on failure.
    fn allocate_block(&self, layout: Layout) -> NonNull<u8>;

    /// Takes back storage obtained from `allocate_block` with the same layout.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this provider's `allocate_block(layout)` and must
    /// not be used afterwards.
    unsafe fn release_block(&self, ptr: NonNull<u8>, layout: Layout);

    /// Blocks currently handed out.
    fn live_blocks(&self) -> usize;
}

/// Blocks from the global allocator.
#[derive(Debug, Default)]
pub struct SystemBlockProvider {
    live: AtomicUsize,
}

impl SystemBlockProvider {
    /// A provider with no live blocks.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            live: AtomicUsize::new(0),
        }
    }
}

// SAFETY: storage comes straight from the global allocator with the requested
// layout.
unsafe impl BlockProvider for SystemBlockProvider {
    fn allocate_block(&self, layout: Layout) -> NonNull<u8> {
        assert!(layout.size() > 0, "weak blocks are never zero-sized");
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(layout)
        };
        self.live.fetch_add(1, Ordering::Relaxed);
        ptr
    }

    unsafe fn release_block(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: the caller passes back a pointer from `allocate_block` with
        // the same layout.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    fn live_blocks(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

/// Blocks backed by their own anonymous page mappings.
///
/// Each block gets a page-rounded [`Region`]; releasing the block unmaps it,
/// so memory goes back to the OS as soon as `shrink` drops the block.
#[derive(Debug, Default)]
pub struct MmapBlockProvider {
    regions: Mutex<HashMap<usize, Region>>,
}

impl MmapBlockProvider {
    /// A provider with no mappings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently mapped for blocks.
    #[must_use]
    pub fn mapped_bytes(&self) -> usize {
        self.regions.lock().values().map(Region::len).sum()
    }
}

// SAFETY: each block gets a fresh page-aligned mapping at least as large as
// the layout, owned by `regions` until released.
unsafe impl BlockProvider for MmapBlockProvider {
    fn allocate_block(&self, layout: Layout) -> NonNull<u8> {
        assert!(
            layout.align() <= sys_alloc::page_size(),
            "weak block alignment exceeds the page size"
        );
        let region = match Region::map(layout.size()) {
            Ok(region) => region,
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %_err, size = layout.size(), "weak_block_map_failed");
                alloc::handle_alloc_error(layout)
            }
        };
        let Some(ptr) = NonNull::new(region.as_ptr()) else {
            alloc::handle_alloc_error(layout)
        };
        self.regions.lock().insert(ptr.as_ptr() as usize, region);
        ptr
    }

    unsafe fn release_block(&self, ptr: NonNull<u8>, _layout: Layout) {
        let region = self.regions.lock().remove(&(ptr.as_ptr() as usize));
        assert!(
            region.is_some(),
            "released a weak block this provider never mapped"
        );
        drop(region);
    }

    fn live_blocks(&self) -> usize {
        self.regions.lock().len()
    }
}
