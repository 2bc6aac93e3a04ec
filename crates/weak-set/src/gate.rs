//! The collector's phase gate.
//!
//! Weak sets do not lock themselves against the collector. Instead the heap
//! owns a [`PhaseGate`] recording which part of a collection is running, and
//! passes it to every mutator-side call. `allocate` and `deallocate` assert
//! that the gate is in [`CollectorPhase::Mutator`]; the cycle driver moves the
//! gate through its phases in order and panics on any other transition.

use std::sync::atomic::{AtomicU8, Ordering};

/// Where the heap's collection state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectorPhase {
    /// No collection in progress; mutators may allocate and deallocate.
    Mutator = 0,
    /// Marking, including weak visiting.
    Marking = 1,
    /// Clearing weak handles to unmarked targets.
    Reaping = 2,
    /// Finalizing cleared handles.
    Sweeping = 3,
    /// Releasing empty blocks.
    Shrinking = 4,
    /// The heap is being torn down and last-chance finalization is running.
    TearingDown = 5,
    /// Teardown finished. Terminal.
    TornDown = 6,
}

impl CollectorPhase {
    /// Decodes a phase stored in the gate's atomic.
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Mutator),
            1 => Some(Self::Marking),
            2 => Some(Self::Reaping),
            3 => Some(Self::Sweeping),
            4 => Some(Self::Shrinking),
            5 => Some(Self::TearingDown),
            6 => Some(Self::TornDown),
            _ => None,
        }
    }

    /// Whether the machine may step from `self` to `to`.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Mutator, Self::Marking | Self::TearingDown)
                | (Self::Marking, Self::Reaping)
                | (Self::Reaping, Self::Sweeping)
                | (Self::Sweeping, Self::Shrinking | Self::Mutator)
                | (Self::Shrinking, Self::Mutator)
                | (Self::TearingDown, Self::TornDown)
        )
    }
}

/// Shared collection state consulted by weak set operations.
#[derive(Debug)]
pub struct PhaseGate {
    phase: AtomicU8,
}

impl Default for PhaseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseGate {
    /// A gate in the mutator phase.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            phase: AtomicU8::new(CollectorPhase::Mutator as u8),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> CollectorPhase {
        CollectorPhase::from_u8(self.phase.load(Ordering::Acquire))
            .unwrap_or(CollectorPhase::Mutator)
    }

    /// Whether mutators may touch weak sets.
    #[must_use]
    pub fn is_mutator_phase(&self) -> bool {
        self.phase() == CollectorPhase::Mutator
    }

    /// Steps from the current phase to `to` if that is a legal transition.
    ///
    /// Concurrent callers race on a compare-exchange; at most one of them
    /// wins a given transition.
    pub fn transition_to(&self, to: CollectorPhase) -> bool {
        let mut current = self.phase();
        loop {
            if !current.can_transition_to(to) {
                return false;
            }
            match self.phase.compare_exchange(
                current as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => {
                    current = CollectorPhase::from_u8(actual).unwrap_or(CollectorPhase::Mutator);
                }
            }
        }
    }

    /// Panics unless mutators are allowed to touch weak sets right now.
    ///
    /// # Panics
    ///
    /// Panics if a collection phase or teardown is in progress.
    #[track_caller]
    pub fn assert_mutator(&self, operation: &str) {
        let phase = self.phase();
        assert!(
            phase == CollectorPhase::Mutator,
            "weak set {operation} while the collector is in {phase:?}"
        );
    }

    /// Opens a collection cycle, moving the gate from `Mutator` to `Marking`.
    ///
    /// The returned guard steps the gate through the remaining phases and
    /// puts it back to `Mutator` when dropped, even if a phase panics.
    ///
    /// # Panics
    ///
    /// Panics if a cycle or teardown is already in progress.
    #[track_caller]
    pub fn begin_cycle(&self) -> CycleGuard<'_> {
        let from = self.phase();
        assert!(
            self.transition_to(CollectorPhase::Marking),
            "cannot begin a weak cycle from {from:?}"
        );
        CycleGuard { gate: self }
    }

    /// Moves the gate into teardown.
    ///
    /// # Panics
    ///
    /// Panics unless the gate is in `Mutator`: tearing down in the middle of
    /// a cycle is rejected.
    #[track_caller]
    pub fn begin_teardown(&self) {
        let from = self.phase();
        assert!(
            self.transition_to(CollectorPhase::TearingDown),
            "cannot tear down weak sets from {from:?}"
        );
    }

    /// Marks teardown finished. The gate stays in `TornDown` for good.
    ///
    /// # Panics
    ///
    /// Panics unless teardown was begun.
    #[track_caller]
    pub fn finish_teardown(&self) {
        assert!(
            self.transition_to(CollectorPhase::TornDown),
            "finish_teardown without begin_teardown"
        );
    }
}

/// An open collection cycle on a [`PhaseGate`].
#[derive(Debug)]
pub struct CycleGuard<'g> {
    gate: &'g PhaseGate,
}

impl CycleGuard<'_> {
    /// Phase the cycle is in.
    #[must_use]
    pub fn phase(&self) -> CollectorPhase {
        self.gate.phase()
    }

    /// Steps the cycle to `to`.
    ///
    /// # Panics
    ///
    /// Panics on an out-of-order transition.
    #[track_caller]
    pub fn advance(&self, to: CollectorPhase) {
        let from = self.gate.phase();
        assert!(
            to != CollectorPhase::Mutator && self.gate.transition_to(to),
            "illegal weak cycle transition {from:?} -> {to:?}"
        );
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.gate
            .phase
            .store(CollectorPhase::Mutator as u8, Ordering::Release);
    }
}
