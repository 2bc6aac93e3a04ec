//! Weak set metrics and statistics.

use std::time::{Duration, Instant};

/// What the most recent weak cycle did across every tracked set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeakCycleMetrics {
    /// Wall time of the whole cycle.
    pub duration: Duration,
    /// Duration of the reap phase.
    pub reap_duration: Duration,
    /// Duration of the sweep phase.
    pub sweep_duration: Duration,
    /// Duration of the shrink phase.
    pub shrink_duration: Duration,
    /// Handles whose target was cleared by reap.
    pub handles_reaped: usize,
    /// Owner callbacks run by sweep.
    pub handles_finalized: usize,
    /// Slots sweep returned to free lists.
    pub slots_recycled: usize,
    /// Blocks shrink gave back to their provider.
    pub blocks_released: usize,
    /// Sets the cycle walked.
    pub sets_visited: usize,
    /// Sets unlinked from the tracking list because they ran out of blocks.
    pub sets_untracked: usize,
    /// Cycles run by this tracking list, including this one.
    pub total_cycles: usize,
}

impl WeakCycleMetrics {
    /// All-zero metrics, as reported before any cycle ran.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::ZERO,
            reap_duration: Duration::ZERO,
            sweep_duration: Duration::ZERO,
            shrink_duration: Duration::ZERO,
            handles_reaped: 0,
            handles_finalized: 0,
            slots_recycled: 0,
            blocks_released: 0,
            sets_visited: 0,
            sets_untracked: 0,
            total_cycles: 0,
        }
    }
}

/// Times the three collector-visible phases of a weak cycle.
///
/// # Example
///
/// ```
/// use weak_set::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... reap every set ...
/// timer.end_reap();
///
/// timer.start();
/// // ... sweep every set ...
/// timer.end_sweep();
///
/// timer.start();
/// // ... shrink every set ...
/// timer.end_shrink();
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Reap phase time.
    pub reap: Duration,
    /// Sweep phase time.
    pub sweep: Duration,
    /// Shrink phase time.
    pub shrink: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// A timer with all phases at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            reap: Duration::ZERO,
            sweep: Duration::ZERO,
            shrink: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// End timing the reap phase.
    pub fn end_reap(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.reap = start.elapsed();
        }
    }

    /// End timing the sweep phase.
    pub fn end_sweep(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.sweep = start.elapsed();
        }
    }

    /// End timing the shrink phase.
    pub fn end_shrink(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.shrink = start.elapsed();
        }
    }
}

/// Cumulative counters kept by each [`WeakSet`](crate::WeakSet).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeakSetStats {
    /// Handles handed out by `allocate`.
    pub handles_allocated: usize,
    /// Handles released early by `deallocate`.
    pub handles_deallocated: usize,
    /// Handles cleared by reap.
    pub handles_reaped: usize,
    /// Owner callbacks run, by sweep or teardown.
    pub handles_finalized: usize,
    /// Blocks obtained from the provider.
    pub blocks_created: usize,
    /// Blocks given back to the provider by shrink.
    pub blocks_released: usize,
}
