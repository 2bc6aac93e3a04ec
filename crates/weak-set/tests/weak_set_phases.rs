//! Reap, sweep and shrink on a single weak set.
//!
//! These tests walk handles through the collector-visible phases and check
//! when targets are cleared, when owners run, and when blocks go away.

use std::sync::{Arc, Mutex};

use weak_set::{
    HeapRef, MarkSet, PhaseGate, WeakContext, WeakHandle, WeakHandleOwner, WeakSet, WeakState,
};

/// Records every finalize call it receives.
struct RecordingOwner {
    name: &'static str,
    calls: Mutex<Vec<(&'static str, WeakHandle, WeakContext)>>,
}

impl RecordingOwner {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(&'static str, WeakHandle, WeakContext)> {
        self.calls.lock().unwrap().clone()
    }
}

impl WeakHandleOwner for RecordingOwner {
    fn finalize(&self, handle: WeakHandle, context: WeakContext) {
        self.calls.lock().unwrap().push((self.name, handle, context));
    }
}

fn object(n: usize) -> HeapRef {
    HeapRef::new(0x10_0000 + n * 64).unwrap()
}

#[test]
fn test_three_owner_scenario() {
    let gate = PhaseGate::new();
    let mut set = WeakSet::new();

    let a = RecordingOwner::new("A");
    let b = RecordingOwner::new("B");
    let c = RecordingOwner::new("C");

    let ha = set.allocate(&gate, object(1), Some(a.clone()), WeakContext::new(1));
    let hb = set.allocate(&gate, object(2), Some(b.clone()), WeakContext::new(2));
    let hc = set.allocate(&gate, object(3), Some(c.clone()), WeakContext::new(3));

    // Only O1 survives marking.
    let marks: MarkSet = [object(1)].into_iter().collect();

    assert_eq!(set.reap(&marks), 2);
    assert_eq!(set.get(ha), Some(object(1)));
    assert_eq!(set.get(hb), None);
    assert_eq!(set.get(hc), None);
    assert_eq!(set.state(hb), Some(WeakState::Dead));
    // Reap never calls owners.
    assert!(b.calls().is_empty());
    assert!(c.calls().is_empty());

    let swept = set.sweep();
    assert_eq!(swept.finalized, 2);
    assert_eq!(b.calls(), vec![("B", hb, WeakContext::new(2))]);
    assert_eq!(c.calls(), vec![("C", hc, WeakContext::new(3))]);
    assert!(a.calls().is_empty());
    assert_eq!(set.get(ha), Some(object(1)));

    // The block still holds A's handle.
    assert_eq!(set.shrink(), 0);
    assert_eq!(set.block_count(), 1);
    assert!(!set.is_empty());

    set.deallocate(&gate, ha);
    assert_eq!(set.shrink(), 1);
    assert!(set.is_empty());
    assert_eq!(set.block_count(), 0);
    assert!(a.calls().is_empty());
}

#[test]
fn test_sweep_without_reap_finalizes_nothing() {
    let gate = PhaseGate::new();
    let mut set = WeakSet::new();
    let owner = RecordingOwner::new("owner");
    let handle = set.allocate(&gate, object(1), Some(owner.clone()), WeakContext::NONE);

    let result = set.sweep();
    assert_eq!(result.finalized, 0);
    assert_eq!(result.recycled, 0);
    assert!(owner.calls().is_empty());
    assert_eq!(set.state(handle), Some(WeakState::Live));
}

#[test]
fn test_reap_keeps_marked_targets_across_cycles() {
    let gate = PhaseGate::new();
    let mut set = WeakSet::new();
    let handle = set.allocate(&gate, object(7), None, WeakContext::NONE);
    let marks: MarkSet = [object(7)].into_iter().collect();

    for _ in 0..5 {
        assert_eq!(set.reap(&marks), 0);
        set.sweep();
        set.shrink();
        assert_eq!(set.get(handle), Some(object(7)));
    }
    assert_eq!(set.stats().handles_reaped, 0);
}

#[test]
fn test_handles_without_owner_are_recycled_silently() {
    let gate = PhaseGate::new();
    let mut set = WeakSet::new();
    let handle = set.allocate(&gate, object(1), None, WeakContext::NONE);

    set.reap(&MarkSet::new());
    let result = set.sweep();
    assert_eq!(result.finalized, 0);
    assert_eq!(result.recycled, 1);
    assert!(!set.contains(handle));
}

#[test]
fn test_deallocated_handle_is_never_finalized() {
    let gate = PhaseGate::new();
    let mut set = WeakSet::new();
    let owner = RecordingOwner::new("owner");
    let handle = set.allocate(&gate, object(1), Some(owner.clone()), WeakContext::NONE);

    set.deallocate(&gate, handle);
    set.reap(&MarkSet::new());
    set.sweep();
    assert!(owner.calls().is_empty());
}

#[test]
fn test_deallocate_after_reap_skips_finalize() {
    let gate = PhaseGate::new();
    let mut set = WeakSet::new();
    let owner = RecordingOwner::new("owner");
    let handle = set.allocate(&gate, object(1), Some(owner.clone()), WeakContext::NONE);

    set.reap(&MarkSet::new());
    // The owning subsystem releases the handle before sweep gets to it.
    set.deallocate(&gate, handle);
    assert_eq!(set.sweep().finalized, 0);
    assert!(owner.calls().is_empty());
}

#[test]
#[should_panic(expected = "deallocated twice")]
fn test_double_deallocate_panics() {
    let gate = PhaseGate::new();
    let mut set = WeakSet::new();
    let handle = set.allocate(&gate, object(1), None, WeakContext::NONE);
    set.deallocate(&gate, handle);
    set.deallocate(&gate, handle);
}

#[test]
#[should_panic(expected = "deallocated twice")]
fn test_deallocate_after_sweep_panics() {
    let gate = PhaseGate::new();
    let mut set = WeakSet::new();
    let _keep = set.allocate(&gate, object(1), None, WeakContext::NONE);
    let handle = set.allocate(&gate, object(2), None, WeakContext::NONE);

    let marks: MarkSet = [object(1)].into_iter().collect();
    set.reap(&marks);
    set.sweep();
    set.deallocate(&gate, handle);
}

#[test]
fn test_last_chance_finalizes_every_owner_once() {
    let gate = PhaseGate::new();
    let mut set = WeakSet::new();
    let owner = RecordingOwner::new("owner");
    for i in 0..10 {
        set.allocate(&gate, object(i), Some(owner.clone()), WeakContext::new(i));
    }
    set.allocate(&gate, object(99), None, WeakContext::NONE);

    assert_eq!(set.last_chance_to_finalize(), 10);
    assert_eq!(set.last_chance_to_finalize(), 0);
    assert_eq!(owner.calls().len(), 10);

    // A sweep after teardown recycles the slots without calling again.
    assert_eq!(set.sweep().finalized, 0);
    assert_eq!(owner.calls().len(), 10);
    assert!(set.is_empty());
}
