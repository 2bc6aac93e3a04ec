//! Weak set tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans and events for weak cycles and block churn.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    /// Phases of a weak cycle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum WeakPhase {
        /// Opaque-root visiting during marking.
        Visit,
        /// Clear handles to unmarked targets.
        Reap,
        /// Finalize cleared handles and recycle their slots.
        Sweep,
        /// Release empty blocks.
        Shrink,
        /// Heap teardown.
        Teardown,
    }

    /// Stable identifier for one weak cycle.
    ///
    /// Correlates every event of a cycle. Starts at 1 and increases
    /// monotonically for the life of the process.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WeakCycleId(pub u64);

    static NEXT_CYCLE_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique cycle ID.
    pub fn next_cycle_id() -> WeakCycleId {
        WeakCycleId(NEXT_CYCLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a span covering a whole weak cycle.
    pub fn trace_weak_cycle(cycle_id: WeakCycleId, sets: usize) -> span::EnteredSpan {
        span!(Level::DEBUG, "weak_cycle", cycle_id = cycle_id.0, sets).entered()
    }

    /// Create a span for one phase.
    pub fn trace_phase(phase: WeakPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "weak_phase", phase = ?phase).entered()
    }

    pub fn log_phase_start(phase: WeakPhase, sets: usize) {
        tracing::debug!(phase = ?phase, sets, "phase_start");
    }

    /// `handles` is the phase's own count: reaped, finalized or kept alive.
    pub fn log_phase_end(phase: WeakPhase, handles: usize, blocks_released: usize) {
        tracing::debug!(phase = ?phase, handles, blocks_released, "phase_end");
    }

    pub fn log_block_created(blocks: usize) {
        tracing::trace!(blocks, "weak_block_created");
    }

    pub fn log_block_released(blocks: usize) {
        tracing::trace!(blocks, "weak_block_released");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WeakCycleId(pub u64);

    /// Stub function when tracing is disabled.
    #[allow(dead_code)]
    pub const fn next_cycle_id() -> WeakCycleId {
        WeakCycleId(0)
    }
}

pub use internal::WeakCycleId;
