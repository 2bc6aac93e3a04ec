//! Per-block slot bitmap.
//!
//! One bit per slot of a [`WeakBlock`](crate::block::WeakBlock). Blocks keep
//! one bitmap for live handles and one for handles waiting to be swept, so the
//! collector phases only touch the slots they care about.

use crate::block::WEAK_BLOCK_CAPACITY;

const WORDS: usize = WEAK_BLOCK_CAPACITY.div_ceil(64);

/// A fixed-size bitmap covering every slot of one weak block.
///
/// # Example
///
/// ```
/// use weak_set::SlotBitmap;
///
/// let mut bitmap = SlotBitmap::new();
/// assert!(!bitmap.is_set(0));
///
/// bitmap.set(0);
/// assert!(bitmap.is_set(0));
/// assert_eq!(bitmap.count(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotBitmap {
    words: [u64; WORDS],
    count: usize,
}

impl SlotBitmap {
    /// An all-clear bitmap.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            words: [0; WORDS],
            count: 0,
        }
    }

    /// Number of slots the bitmap covers.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        WEAK_BLOCK_CAPACITY
    }

    /// Number of set bits.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// No bit is set.
    #[must_use]
    pub const fn is_clear(&self) -> bool {
        self.count == 0
    }

    /// Sets `index`. Setting an already set bit is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn set(&mut self, index: usize) {
        let (word, mask) = Self::locate(index);
        if self.words[word] & mask == 0 {
            self.words[word] |= mask;
            self.count += 1;
        }
    }

    /// Clears `index`. Clearing an already clear bit is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn unset(&mut self, index: usize) {
        let (word, mask) = Self::locate(index);
        if self.words[word] & mask != 0 {
            self.words[word] &= !mask;
            self.count -= 1;
        }
    }

    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn is_set(&self, index: usize) -> bool {
        let (word, mask) = Self::locate(index);
        self.words[word] & mask != 0
    }

    /// Clears every bit.
    pub fn clear(&mut self) {
        self.words = [0; WORDS];
        self.count = 0;
    }

    /// Indices of the set bits, ascending.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(word_index, &word)| SetBits {
                word,
                base: word_index * 64,
            })
    }

    fn locate(index: usize) -> (usize, u64) {
        assert!(
            index < WEAK_BLOCK_CAPACITY,
            "slot index {index} out of bounds for a block of {WEAK_BLOCK_CAPACITY}"
        );
        (index / 64, 1u64 << (index % 64))
    }
}

struct SetBits {
    word: u64,
    base: usize,
}

impl Iterator for SetBits {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.word == 0 {
            return None;
        }
        let bit = self.word.trailing_zeros() as usize;
        // Clear the lowest set bit.
        self.word &= self.word - 1;
        Some(self.base + bit)
    }
}
