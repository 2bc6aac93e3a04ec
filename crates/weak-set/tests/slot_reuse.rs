//! Recycled slots carry nothing over from their previous occupant.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use weak_set::{
    HeapRef, MarkSet, PhaseGate, WeakContext, WeakHandle, WeakHandleOwner, WeakSet, WeakState,
    WEAK_BLOCK_CAPACITY,
};

struct CountingOwner(AtomicUsize);

impl WeakHandleOwner for CountingOwner {
    fn finalize(&self, _handle: WeakHandle, _context: WeakContext) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn object(n: usize) -> HeapRef {
    HeapRef::new(0x7000 + n * 8).unwrap()
}

#[test]
fn test_swept_slot_reused_without_residue() {
    let gate = PhaseGate::new();
    let mut set = WeakSet::new();
    let owner = Arc::new(CountingOwner(AtomicUsize::new(0)));

    let old = set.allocate(&gate, object(1), Some(owner.clone()), WeakContext::new(42));
    set.reap(&MarkSet::new());
    set.sweep();
    assert_eq!(owner.0.load(Ordering::SeqCst), 1);

    // Same block, same slot, fresh contents.
    let new = set.allocate(&gate, object(2), None, WeakContext::NONE);
    assert_eq!(new.index(), old.index());
    assert_ne!(new.generation(), old.generation());
    assert_eq!(set.get(new), Some(object(2)));
    assert_eq!(set.context(new), Some(WeakContext::NONE));
    assert_eq!(set.state(new), Some(WeakState::Live));

    // The stale handle sees nothing.
    assert!(!set.contains(old));
    assert_eq!(set.get(old), None);
    assert_eq!(set.context(old), None);

    // The new occupant has no owner: its death calls nobody.
    set.reap(&MarkSet::new());
    set.sweep();
    assert_eq!(owner.0.load(Ordering::SeqCst), 1);
}

#[test]
fn test_deallocated_slot_reused_without_residue() {
    let gate = PhaseGate::new();
    let mut set = WeakSet::new();
    let owner = Arc::new(CountingOwner(AtomicUsize::new(0)));

    let old = set.allocate(&gate, object(1), Some(owner.clone()), WeakContext::new(1));
    set.deallocate(&gate, old);
    let new = set.allocate(&gate, object(3), None, WeakContext::new(3));
    assert_eq!(new.index(), old.index());

    set.reap(&MarkSet::new());
    set.sweep();
    // Neither the released handle nor its successor reached the old owner.
    assert_eq!(owner.0.load(Ordering::SeqCst), 0);
}

#[test]
#[should_panic(expected = "deallocated twice")]
fn test_stale_handle_cannot_free_new_occupant() {
    let gate = PhaseGate::new();
    let mut set = WeakSet::new();
    let old = set.allocate(&gate, object(1), None, WeakContext::NONE);
    set.deallocate(&gate, old);
    let _new = set.allocate(&gate, object(2), None, WeakContext::NONE);

    // Same slot, older generation.
    set.deallocate(&gate, old);
}

#[test]
fn test_handle_outlives_its_released_block() {
    let gate = PhaseGate::new();
    let mut set = WeakSet::new();
    let old = set.allocate(&gate, object(1), None, WeakContext::NONE);
    set.deallocate(&gate, old);
    set.reset_allocator();
    assert_eq!(set.shrink(), 1);

    let new = set.allocate(&gate, object(2), None, WeakContext::NONE);
    assert_ne!(new, old);
    assert_eq!(set.get(old), None);
    assert_eq!(set.get(new), Some(object(2)));

    // The stale handle cannot release the new occupant.
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        set.deallocate(&gate, old);
    }));
    assert!(result.is_err());
    assert!(set.contains(new));
    assert_eq!(set.get(new), Some(object(2)));
}

#[test]
fn test_full_turnover_keeps_block_count() {
    let gate = PhaseGate::new();
    let mut set = WeakSet::new();

    for round in 0..10 {
        let handles: Vec<_> = (0..WEAK_BLOCK_CAPACITY * 2)
            .map(|i| set.allocate(&gate, object(round * 1000 + i), None, WeakContext::NONE))
            .collect();
        assert_eq!(set.block_count(), 2);
        for handle in handles {
            set.deallocate(&gate, handle);
        }
        assert!(set.is_empty());
        set.reset_allocator();
    }
    assert_eq!(set.stats().blocks_created, 2);
}
