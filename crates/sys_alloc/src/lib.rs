//! Page-granular anonymous memory regions.
//!
//! Weak blocks are carved straight out of the operating system instead of the
//! global allocator so that a released block gives its pages back immediately.
//! A [`Region`] owns one such mapping and unmaps it on drop.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the granularity a mapping's length is rounded up to.
///
/// On Windows this is the allocation granularity (typically 64KB), elsewhere
/// the page size.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Rounds `len` up to a whole number of pages.
///
/// Returns `None` on overflow.
#[must_use]
pub fn round_to_pages(len: usize) -> Option<usize> {
    let page = page_size();
    len.checked_add(page - 1).map(|n| n & !(page - 1))
}

/// An owned, zero-filled, read/write anonymous mapping.
pub struct Region {
    inner: os::RegionInner,
}

impl Region {
    /// Maps a fresh region of at least `len` bytes.
    ///
    /// The length is rounded up to the page size; the start address is page
    /// aligned.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero or overflowing length and the OS
    /// error if the mapping itself fails.
    pub fn map(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "region length must be greater than 0",
            ));
        }
        let len = round_to_pages(len).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "region length overflows")
        })?;

        // SAFETY: a null hint lets the OS pick the placement, so the new
        // mapping cannot alias any existing allocation.
        let inner = unsafe { os::RegionInner::map_anon(len)? };
        Ok(Self { inner })
    }

    /// Start of the region.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Length of the region in bytes (a multiple of the page size).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Always false for a mapped region; present for API symmetry with `len`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Whether `addr` falls inside this region.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.as_ptr() as usize;
        addr >= start && addr < start + self.len()
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len())
            .finish()
    }
}

// SAFETY: the region is plain memory owned by this value; access to its
// contents is synchronized by whoever hands out pointers into it.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}
