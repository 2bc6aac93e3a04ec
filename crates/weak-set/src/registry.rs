//! The heap's list of weak sets that own blocks.
//!
//! Reap has to finish for every weak set in the heap before any set is
//! swept, or a finalizer could observe a weak handle that the collector meant
//! to have cleared already. [`ActiveWeakSets`] keeps the sets that currently
//! own blocks and drives each phase over all of them before starting the
//! next.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::gate::{CollectorPhase, CycleGuard, PhaseGate};
use crate::handle::{WeakHandle, WeakHandleOwner};
use crate::heap::{HeapRef, Liveness, MarkVisitor, WeakContext};
use crate::metrics::{PhaseTimer, WeakCycleMetrics};
use crate::set::WeakSet;

#[cfg(feature = "tracing")]
use crate::tracing::internal::{
    log_phase_end, log_phase_start, next_cycle_id, trace_phase, trace_weak_cycle, WeakPhase,
};

/// A weak set shared between its owner and the tracking list.
pub type SharedWeakSet = Arc<Mutex<WeakSet>>;

/// Wraps a set for sharing with [`ActiveWeakSets`].
#[must_use]
pub fn share(set: WeakSet) -> SharedWeakSet {
    Arc::new(Mutex::new(set))
}

/// Knobs for [`ActiveWeakSets::collect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeakCycleConfig {
    /// Run shrink after sweep.
    pub shrink: bool,
    /// Unlink sets whose block list became empty after shrink.
    pub untrack_empty_sets: bool,
}

impl Default for WeakCycleConfig {
    fn default() -> Self {
        Self {
            shrink: true,
            untrack_empty_sets: true,
        }
    }
}

/// Tracking list of weak sets with blocks.
///
/// Lock order: a set's mutex is always taken before the list's, never the
/// other way round.
#[derive(Debug, Default)]
pub struct ActiveWeakSets {
    sets: Mutex<Vec<SharedWeakSet>>,
    config: Mutex<WeakCycleConfig>,
    last_metrics: Mutex<WeakCycleMetrics>,
    total_cycles: AtomicUsize,
}

impl ActiveWeakSets {
    /// An empty list with the default config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty list using `config`.
    #[must_use]
    pub fn with_config(config: WeakCycleConfig) -> Self {
        Self {
            config: Mutex::new(config),
            ..Self::default()
        }
    }

    /// The config the next cycle will use.
    #[must_use]
    pub fn config(&self) -> WeakCycleConfig {
        *self.config.lock()
    }

    /// Replaces the config for later cycles.
    pub fn set_config(&self, config: WeakCycleConfig) {
        *self.config.lock() = config;
    }

    /// Sets currently on the list.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sets.lock().len()
    }

    /// No set is on the list.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sets.lock().is_empty()
    }

    /// Whether `set` is on the list.
    #[must_use]
    pub fn contains(&self, set: &SharedWeakSet) -> bool {
        self.sets.lock().iter().any(|s| Arc::ptr_eq(s, set))
    }

    /// Links `set` if it owns blocks and is not linked yet.
    ///
    /// Returns whether the set was added.
    pub fn track(&self, set: &SharedWeakSet) -> bool {
        let mut guard = set.lock();
        if guard.is_on_list() || guard.block_count() == 0 {
            return false;
        }
        guard.set_on_list(true);
        self.sets.lock().push(Arc::clone(set));
        true
    }

    /// Unlinks `set`. Returns whether it was on the list.
    pub fn untrack(&self, set: &SharedWeakSet) -> bool {
        let mut guard = set.lock();
        if !guard.is_on_list() {
            return false;
        }
        guard.set_on_list(false);
        self.sets.lock().retain(|s| !Arc::ptr_eq(s, set));
        true
    }

    /// Allocates a handle in `set` and links the set if this gave it its
    /// first block.
    ///
    /// # Panics
    ///
    /// Panics if `gate` is not in the mutator phase.
    pub fn allocate(
        &self,
        gate: &PhaseGate,
        set: &SharedWeakSet,
        target: HeapRef,
        owner: Option<Arc<dyn WeakHandleOwner>>,
        context: WeakContext,
    ) -> WeakHandle {
        // Checked before locking so a finalizer that allocates panics
        // instead of deadlocking on its own set.
        gate.assert_mutator("allocate");

        let mut guard = set.lock();
        let handle = guard.allocate(gate, target, owner, context);
        if !guard.is_on_list() {
            guard.set_on_list(true);
            self.sets.lock().push(Arc::clone(set));
        }
        handle
    }

    /// Releases `handle` from `set` immediately.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`WeakSet::deallocate`].
    pub fn deallocate(&self, gate: &PhaseGate, set: &SharedWeakSet, handle: WeakHandle) {
        gate.assert_mutator("deallocate");
        set.lock().deallocate(gate, handle);
    }

    /// Weak visiting over every tracked set, repeated until a pass marks
    /// nothing new. Returns how many targets were marked in total.
    ///
    /// # Panics
    ///
    /// Panics unless `gate` is in [`CollectorPhase::Marking`].
    pub fn visit(&self, gate: &PhaseGate, visitor: &mut dyn MarkVisitor) -> usize {
        let phase = gate.phase();
        assert!(
            phase == CollectorPhase::Marking,
            "weak visiting outside marking (gate is in {phase:?})"
        );

        let sets = self.snapshot();
        #[cfg(feature = "tracing")]
        let _span = trace_phase(WeakPhase::Visit);

        let mut total = 0;
        loop {
            let pass: usize = sets.iter().map(|set| set.lock().visit(visitor)).sum();
            total += pass;
            if pass == 0 {
                break;
            }
        }

        #[cfg(feature = "tracing")]
        log_phase_end(WeakPhase::Visit, total, 0);
        total
    }

    /// Runs a whole weak cycle: opens it on `gate`, then reaps, sweeps and
    /// (if configured) shrinks every tracked set.
    ///
    /// `liveness` must reflect a completed mark.
    ///
    /// # Panics
    ///
    /// Panics if `gate` is not in the mutator phase.
    pub fn collect(&self, gate: &PhaseGate, liveness: &dyn Liveness) -> WeakCycleMetrics {
        self.finish_cycle(gate.begin_cycle(), liveness)
    }

    /// Finishes a cycle opened with [`PhaseGate::begin_cycle`], after the
    /// caller has marked and visited.
    ///
    /// Every set is reaped before any set is swept. The gate is back in
    /// `Mutator` when this returns.
    ///
    /// # Panics
    ///
    /// Panics unless the cycle is still in [`CollectorPhase::Marking`].
    pub fn finish_cycle(&self, cycle: CycleGuard<'_>, liveness: &dyn Liveness) -> WeakCycleMetrics {
        let start = Instant::now();
        let config = self.config();
        let sets = self.snapshot();

        #[cfg(feature = "tracing")]
        let _cycle_span = trace_weak_cycle(next_cycle_id(), sets.len());

        let mut metrics = WeakCycleMetrics {
            sets_visited: sets.len(),
            ..WeakCycleMetrics::new()
        };
        let mut timer = PhaseTimer::new();

        cycle.advance(CollectorPhase::Reaping);
        timer.start();
        {
            #[cfg(feature = "tracing")]
            let _span = trace_phase(WeakPhase::Reap);
            #[cfg(feature = "tracing")]
            log_phase_start(WeakPhase::Reap, sets.len());

            for set in &sets {
                metrics.handles_reaped += set.lock().reap(liveness);
            }

            #[cfg(feature = "tracing")]
            log_phase_end(WeakPhase::Reap, metrics.handles_reaped, 0);
        }
        timer.end_reap();

        cycle.advance(CollectorPhase::Sweeping);
        timer.start();
        {
            #[cfg(feature = "tracing")]
            let _span = trace_phase(WeakPhase::Sweep);
            #[cfg(feature = "tracing")]
            log_phase_start(WeakPhase::Sweep, sets.len());

            for set in &sets {
                let result = set.lock().sweep();
                metrics.handles_finalized += result.finalized;
                metrics.slots_recycled += result.recycled;
            }

            #[cfg(feature = "tracing")]
            log_phase_end(WeakPhase::Sweep, metrics.handles_finalized, 0);
        }
        timer.end_sweep();

        if config.shrink {
            cycle.advance(CollectorPhase::Shrinking);
            timer.start();

            #[cfg(feature = "tracing")]
            let _span = trace_phase(WeakPhase::Shrink);
            #[cfg(feature = "tracing")]
            log_phase_start(WeakPhase::Shrink, sets.len());

            let mut emptied = Vec::new();
            for set in &sets {
                let mut guard = set.lock();
                metrics.blocks_released += guard.shrink();
                if config.untrack_empty_sets && guard.block_count() == 0 {
                    guard.set_on_list(false);
                    emptied.push(Arc::clone(set));
                }
            }
            if !emptied.is_empty() {
                self.sets
                    .lock()
                    .retain(|s| !emptied.iter().any(|e| Arc::ptr_eq(s, e)));
            }
            metrics.sets_untracked = emptied.len();

            #[cfg(feature = "tracing")]
            log_phase_end(WeakPhase::Shrink, 0, metrics.blocks_released);
            timer.end_shrink();
        }

        drop(cycle);

        metrics.reap_duration = timer.reap;
        metrics.sweep_duration = timer.sweep;
        metrics.shrink_duration = timer.shrink;
        metrics.duration = start.elapsed();
        metrics.total_cycles = self.total_cycles.fetch_add(1, Ordering::Relaxed) + 1;
        *self.last_metrics.lock() = metrics;
        metrics
    }

    /// Heap teardown: last-chance finalization of every tracked set.
    ///
    /// Moves `gate` through `TearingDown` to `TornDown`; no weak set
    /// operation is allowed afterwards. Returns how many owners ran.
    ///
    /// # Panics
    ///
    /// Panics if a cycle is in progress.
    pub fn last_chance_to_finalize(&self, gate: &PhaseGate) -> usize {
        gate.begin_teardown();
        let sets = self.snapshot();

        #[cfg(feature = "tracing")]
        let _span = trace_phase(WeakPhase::Teardown);
        #[cfg(feature = "tracing")]
        log_phase_start(WeakPhase::Teardown, sets.len());

        let finalized = sets
            .iter()
            .map(|set| set.lock().last_chance_to_finalize())
            .sum();

        #[cfg(feature = "tracing")]
        log_phase_end(WeakPhase::Teardown, finalized, 0);

        gate.finish_teardown();
        finalized
    }

    /// Metrics of the most recent [`collect`](Self::collect) or
    /// [`finish_cycle`](Self::finish_cycle).
    #[must_use]
    pub fn last_cycle_metrics(&self) -> WeakCycleMetrics {
        *self.last_metrics.lock()
    }

    fn snapshot(&self) -> Vec<SharedWeakSet> {
        self.sets.lock().clone()
    }
}
