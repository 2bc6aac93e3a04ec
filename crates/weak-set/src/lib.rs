//! Weak reference tracking for mark-sweep garbage collectors.
//!
//! `weak-set` lets code outside a collector hold references to heap objects
//! without keeping them alive, and tells an optional owner exactly once when
//! such an object dies. Handles live in **block-structured storage** of their
//! own, separate from the object heap, and the collector drives them through
//! three phases per cycle:
//!
//! - **Reap** clears every handle whose target was not marked.
//! - **Sweep** calls each cleared handle's owner once and recycles the slot.
//! - **Shrink** returns empty blocks to their [`BlockProvider`].
//!
//! Reap runs for every set before sweep runs for any, so a finalizer never
//! sees a weak handle the collector meant to clear.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use weak_set::{HeapRef, MarkSet, PhaseGate, WeakContext, WeakHandle, WeakHandleOwner, WeakSet};
//!
//! let gate = PhaseGate::new();
//! let mut set = WeakSet::new();
//!
//! let finalized = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&finalized);
//! let owner: Arc<dyn WeakHandleOwner> = Arc::new(move |_: WeakHandle, _: WeakContext| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! let object = HeapRef::new(0x1000).unwrap();
//! let handle = set.allocate(&gate, object, Some(owner), WeakContext::NONE);
//! assert_eq!(set.get(handle), Some(object));
//!
//! // Nothing was marked: the object is dead.
//! set.reap(&MarkSet::new());
//! assert_eq!(set.get(handle), None);
//!
//! set.sweep();
//! assert_eq!(finalized.load(Ordering::SeqCst), 1);
//!
//! set.shrink();
//! assert!(set.is_empty());
//! ```
//!
//! # Thread Safety
//!
//! A [`WeakSet`] is `Send` but not `Sync`; share it as a [`SharedWeakSet`].
//! Mutators and the collector are kept apart by the [`PhaseGate`] passed to
//! every mutator-side call, not by the set itself.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod bitmap;
mod block;
mod gate;
mod handle;
mod heap;
mod metrics;
mod provider;
mod registry;
mod set;
mod tracing;

pub use bitmap::SlotBitmap;
pub use block::{SweepResult, WeakBlock, WEAK_BLOCK_CAPACITY};
pub use gate::{CollectorPhase, CycleGuard, PhaseGate};
pub use handle::{WeakHandle, WeakHandleOwner, WeakState};
pub use heap::{HeapRef, Liveness, MarkSet, MarkVisitor, WeakContext};
pub use metrics::{PhaseTimer, WeakCycleMetrics, WeakSetStats};
pub use provider::{BlockProvider, MmapBlockProvider, SystemBlockProvider};
pub use registry::{share, ActiveWeakSets, SharedWeakSet, WeakCycleConfig};
pub use set::WeakSet;
pub use self::tracing::WeakCycleId;
