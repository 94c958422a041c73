//! The old-generation cycle driver.
//!
//! One [`OldGc::collect`] call is one driver invocation, not necessarily one
//! whole cycle. A cycle marks old, processes weak roots, reclaims regions
//! with no live data and then coalesces and fills the remaining old regions.
//! Coalesce-and-fill may be preempted by a young collection any number of
//! times; the next invocation then skips straight to it and continues with
//! the regions still left.
//!
//! Two signals make this work:
//!
//! - the **preemption guard** says "the old cycle may be interrupted right
//!   now". It is set around concurrent marking and coalesce-and-fill, and
//!   clearing it is a race the regulator and the driver settle with
//!   compare-and-swap;
//! - the **mixed-evacuation prep flag** says "coalesce-and-fill has started
//!   and not yet finished". It survives aborts and is cleared only when the
//!   whole candidate list was processed.
//!
//! Weak roots are processed before coalesce-and-fill, and filling is never
//! preemptible during weak-root processing: fillers overwrite exactly the
//! unmarked referents weak-root processing still inspects.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::gc::coalesce::CoalesceAndFillTask;
use crate::gc::mark::{ConcurrentMark, ParallelMark};
use crate::gc::state::{DegenPoint, GcCause};
use crate::gc::strategy::CollectionStrategy;
use crate::gc::verify::Verifier;
use crate::gc::workers::{WorkerPool, WorkerThreads};
use crate::generational::GenerationalHeap;
use crate::heap::HeapLocker;
use crate::metrics::{CycleOutcome, OldGcMetrics};
use crate::tracing::GcPhase;

/// States of the old-generation driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OldPhase {
    /// No invocation in progress, or the last one aborted.
    Idle = 0,
    /// Concurrent and final marking.
    Marking = 1,
    /// Clearing weak slots to dead old objects.
    WeakRoots = 2,
    /// Reclaiming regions found entirely dead.
    EarlyCleanup = 3,
    /// Filling dead space in old regions; resumable.
    CoalesceAndFill = 4,
    /// Mixed-evacuation candidates are available to young cycles.
    EvacuationReady = 5,
}

impl OldPhase {
    #[must_use]
    pub const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Marking,
            2 => Self::WeakRoots,
            3 => Self::EarlyCleanup,
            4 => Self::CoalesceAndFill,
            5 => Self::EvacuationReady,
            _ => Self::Idle,
        }
    }

    /// Whether the driver may move from `self` to `to`. Any phase may return
    /// to [`Idle`](Self::Idle) on abort.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (_, Self::Idle)
                | (Self::Idle | Self::EvacuationReady, Self::Marking)
                | (Self::Marking, Self::WeakRoots | Self::EarlyCleanup)
                | (Self::WeakRoots, Self::EarlyCleanup)
                | (Self::Idle | Self::EarlyCleanup, Self::CoalesceAndFill)
                | (Self::EarlyCleanup | Self::CoalesceAndFill, Self::EvacuationReady)
        )
    }
}

/// A global pause.
///
/// The driver runs final mark and final roots through it. An implementation
/// must stop mutator progress for the duration of `op` and hand it the heap
/// lock.
pub trait Safepoint: Send + Sync {
    fn run(&self, heap: &GenerationalHeap, name: &'static str, op: &mut dyn FnMut(&mut HeapLocker<'_>));
}

/// Runs pause operations under the heap lock.
///
/// Mutators allocating through the heap block on the lock, which stands in
/// for a real safepoint in an embedding with cooperative mutators.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapLockSafepoint;

impl Safepoint for HeapLockSafepoint {
    fn run(&self, heap: &GenerationalHeap, name: &'static str, op: &mut dyn FnMut(&mut HeapLocker<'_>)) {
        #[cfg(feature = "tracing")]
        let _span = crate::gc::tracing::span_pause(name).entered();
        #[cfg(not(feature = "tracing"))]
        let _ = name;
        let mut lock = heap.lock();
        op(&mut lock);
    }
}

/// The old-generation cycle driver.
pub struct OldGc {
    heap: Arc<GenerationalHeap>,
    workers: Box<dyn WorkerPool + Send>,
    marker: Box<dyn ConcurrentMark>,
    safepoint: Box<dyn Safepoint>,
    phase: AtomicU8,
    candidates: Mutex<Vec<usize>>,
    degen_point: Mutex<DegenPoint>,
    last_metrics: Mutex<Option<OldGcMetrics>>,
}

impl std::fmt::Debug for OldGc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OldGc")
            .field("phase", &self.phase())
            .field("degen_point", &self.degen_point())
            .finish_non_exhaustive()
    }
}

impl OldGc {
    /// Driver with a thread pool of `config.workers`, parallel marking and
    /// heap-lock pauses.
    #[must_use]
    pub fn new(heap: Arc<GenerationalHeap>) -> Self {
        let workers = WorkerThreads::new(heap.config().workers);
        Self::with_collaborators(
            heap,
            Box::new(workers),
            Box::new(ParallelMark::new()),
            Box::new(HeapLockSafepoint),
        )
    }

    #[must_use]
    pub fn with_collaborators(
        heap: Arc<GenerationalHeap>,
        workers: Box<dyn WorkerPool + Send>,
        marker: Box<dyn ConcurrentMark>,
        safepoint: Box<dyn Safepoint>,
    ) -> Self {
        let candidates = Vec::with_capacity(heap.num_regions());
        Self {
            heap,
            workers,
            marker,
            safepoint,
            phase: AtomicU8::new(OldPhase::Idle as u8),
            candidates: Mutex::new(candidates),
            degen_point: Mutex::new(DegenPoint::Unset),
            last_metrics: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn heap(&self) -> &Arc<GenerationalHeap> {
        &self.heap
    }

    #[must_use]
    pub fn phase(&self) -> OldPhase {
        OldPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Where the last invocation handed over to a degenerated collection.
    #[must_use]
    pub fn degen_point(&self) -> DegenPoint {
        *self.degen_point.lock()
    }

    /// Statistics of the last invocation.
    #[must_use]
    pub fn last_metrics(&self) -> Option<OldGcMetrics> {
        *self.last_metrics.lock()
    }

    /// Capacity of the candidate buffer, fixed at the heap's region count.
    #[must_use]
    pub fn candidate_capacity(&self) -> usize {
        self.candidates.lock().capacity()
    }

    fn transition_to(&self, to: OldPhase) {
        let from = self.phase();
        debug_assert!(
            from.can_transition_to(to),
            "illegal old phase transition {from:?} -> {to:?}"
        );
        let swapped = self
            .phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire);
        debug_assert!(swapped.is_ok(), "old phase changed underneath the driver");
    }

    fn traced<R>(&self, phase: GcPhase, f: impl FnOnce() -> R) -> R {
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_phase(phase);
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_phase_start(phase, self.heap.old().used());
        let result = f();
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_phase_end(phase, self.heap.old().used());
        #[cfg(not(feature = "tracing"))]
        let _ = phase;
        result
    }

    /// Runs one driver invocation.
    ///
    /// Returns `true` once old regions are parsable and mixed-evacuation
    /// candidates are ready. Returns `false` when the invocation was
    /// cancelled or preempted; [`degen_point`](Self::degen_point) then says
    /// where a degenerated collection would take over. Cancellation is not
    /// cleared here; the caller clears it before the next invocation.
    pub fn collect(&self, cause: GcCause) -> bool {
        let gc_id = crate::tracing::internal::next_gc_id();
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_gc_collection("old", gc_id);
        #[cfg(not(feature = "tracing"))]
        let _ = gc_id;

        let start = Instant::now();
        let resumed = self
            .heap
            .gc_state()
            .is_concurrent_prep_for_mixed_evacuation_in_progress();
        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_old_gc_start(cause, resumed);
        #[cfg(not(feature = "tracing"))]
        let _ = cause;

        *self.degen_point.lock() = DegenPoint::Unset;
        self.heap.set_active_strategy(CollectionStrategy::Old);

        let mut metrics = OldGcMetrics::new(resumed);
        let completed = self.run(&mut metrics);
        metrics.total = start.elapsed();
        *self.last_metrics.lock() = Some(metrics);
        completed
    }

    fn run(&self, metrics: &mut OldGcMetrics) -> bool {
        let heap = &*self.heap;
        let state = heap.gc_state();

        if state.is_concurrent_prep_for_mixed_evacuation_in_progress() {
            #[cfg(feature = "tracing")]
            crate::gc::tracing::log_resume(heap.old_heuristics().old_coalesce_and_fill_candidates(heap));
        } else {
            state.old_preemption().set();
            self.transition_to(OldPhase::Marking);
            self.safepoint.run(heap, "Init Mark (Old)", &mut |_lock| {
                self.marker.init_mark(heap, CollectionStrategy::Old);
            });

            metrics.phases.start();
            let marked = self.traced(GcPhase::Mark, || {
                self.marker
                    .mark_concurrent(heap, &*self.workers, CollectionStrategy::Old)
            });
            metrics.phases.end_mark();

            if !state.old_preemption().try_unset() {
                // The regulator cleared the guard and is about to cancel.
                state.wait_for_cancellation();
            }
            if self.check_cancellation_and_abort(DegenPoint::Mark, metrics) {
                return false;
            }
            debug_assert!(marked, "marking stopped early without cancellation");

            metrics.phases.start();
            self.traced(GcPhase::FinalMark, || {
                self.safepoint
                    .run(heap, "Final Mark (Old)", &mut |lock| self.final_mark(lock));
            });
            metrics.phases.end_final_mark();

            assert!(
                !state.is_evacuation_in_progress(),
                "old marking does not build a collection set"
            );

            if state.is_concurrent_weak_root_in_progress() {
                self.transition_to(OldPhase::WeakRoots);
                metrics.phases.start();
                self.traced(GcPhase::WeakRoots, || heap.weak_refs().process(heap));
                metrics.phases.end_weak_roots();
            }

            self.transition_to(OldPhase::EarlyCleanup);
            metrics.phases.start();
            self.traced(GcPhase::Cleanup, || heap.recycle_trash(&mut heap.lock()));
            metrics.phases.end_cleanup();
            heap.log_free_set_status();

            state.set_concurrent_prep_for_mixed_evacuation_in_progress(true);
        }

        // Weak roots are done; filling may be interrupted from here on.
        state.old_preemption().set();
        if self.check_cancellation_and_abort(DegenPoint::Evac, metrics) {
            return false;
        }

        self.safepoint
            .run(heap, "Final Roots", &mut |_lock| self.final_roots());

        if state.is_concurrent_prep_for_mixed_evacuation_in_progress() {
            self.transition_to(OldPhase::CoalesceAndFill);
            if !self.coalesce_and_fill(metrics) {
                // Candidates and the prep flag stay; the next invocation resumes.
                if !self.check_cancellation_and_abort(DegenPoint::OutsideCycle, metrics) {
                    self.stand_down();
                }
                metrics.outcome = CycleOutcome::Preempted;
                return false;
            }
        }

        if !state.old_preemption().try_unset() {
            // Lost the race to the regulator; wait for its cancellation.
            state.wait_for_cancellation();
        }

        self.transition_to(OldPhase::EvacuationReady);
        heap.old_heuristics().start_old_evacuations();
        heap.reset_generation_reserves();
        heap.compute_old_generation_balance(heap.young().available(), 0);
        let result = heap.balance_generations(&mut heap.lock());
        result.log("Old Mark", heap);
        true
    }

    /// Old final mark. Runs inside the final-mark pause.
    fn final_mark(&self, lock: &mut HeapLocker<'_>) {
        let heap = &*self.heap;
        let state = heap.gc_state();

        assert!(
            !state.has_forwarded_objects(),
            "no forwarded objects may exist at old final mark"
        );
        if heap.config().verify {
            Verifier::new(heap).verify_roots_no_forwarded();
        }

        self.marker.finish_mark(heap, CollectionStrategy::Old);
        debug_assert!(!state.cancelled_gc(), "STW mark cannot be cancelled");

        // Old marking is over; its queues belong to nobody until the next one.
        heap.young().set_old_gen_task_queues(None);
        heap.old().set_task_queues(None);

        for region in heap.regions() {
            if region.is_old() && region.is_active() {
                let allocated_during_mark = region.top().saturating_sub(region.tams());
                if allocated_during_mark > 0 {
                    region.add_live_words(allocated_during_mark);
                }
            }
        }
        heap.old_heuristics().prepare_for_old_collections(heap, lock);

        if heap.config().weak_roots && !heap.weak_refs().is_empty() {
            state.set_concurrent_weak_root_in_progress(true);
        }

        if heap.config().verify_after_old_mark {
            Verifier::new(heap).verify_after_old_mark();
        }
    }

    fn final_roots(&self) {
        let heap = &*self.heap;
        if heap.config().verify {
            Verifier::new(heap).verify_roots_no_forwarded();
        }
        heap.gc_state().set_concurrent_weak_root_in_progress(false);
    }

    fn coalesce_and_fill(&self, metrics: &mut OldGcMetrics) -> bool {
        let heap = &*self.heap;
        let mut candidates = self.candidates.lock();
        let count = heap
            .old_heuristics()
            .get_coalesce_and_fill_candidates(heap, &mut candidates);
        let workers = self.workers.active_workers();
        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_coalesce_and_fill_start(count, workers);
        #[cfg(not(feature = "tracing"))]
        let _ = count;

        metrics.phases.start();
        let task = CoalesceAndFillTask::new(heap, &candidates, workers);
        self.traced(GcPhase::CoalesceAndFill, || self.workers.run_task(&task));
        metrics.phases.end_coalesce_and_fill();
        metrics.regions_filled += task.regions_filled();
        metrics.humongous_skipped += task.humongous_skipped();

        if task.is_completed() {
            heap.gc_state()
                .set_concurrent_prep_for_mixed_evacuation_in_progress(false);
            true
        } else {
            #[cfg(feature = "tracing")]
            crate::gc::tracing::log_coalesce_and_fill_suspended(task.regions_filled());
            false
        }
    }

    /// Releases the guard if still held and returns to `Idle`.
    fn stand_down(&self) {
        let _ = self.heap.gc_state().old_preemption().try_unset();
        self.phase.store(OldPhase::Idle as u8, Ordering::Release);
    }

    /// Aborts at `point` if the cycle was cancelled.
    fn check_cancellation_and_abort(&self, point: DegenPoint, metrics: &mut OldGcMetrics) -> bool {
        if self.heap.gc_state().cancelled_gc() {
            self.abort(point, metrics);
            true
        } else {
            false
        }
    }

    fn abort(&self, point: DegenPoint, metrics: &mut OldGcMetrics) {
        *self.degen_point.lock() = point;
        self.stand_down();
        metrics.outcome = CycleOutcome::Cancelled(point);
        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_abort(point);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::state::GuardState;
    use crate::gc::workers::WorkerTask;
    use crate::heap::HeapConfig;
    use crate::object::{class_word, Address};
    use crate::region::Affiliation;

    /// Five old regions laid out `[A:4][dead:6][dead:8][B][C:4]` with A, B and
    /// C rooted. Returns the heap and the region indices in candidate order.
    fn heap_with_five_old_regions() -> (Arc<GenerationalHeap>, Vec<usize>) {
        let heap = GenerationalHeap::new(HeapConfig {
            region_words: 256,
            num_regions: 16,
            max_tlab_words: 256,
            workers: 2,
            initial_old_percent: 50,
            ..HeapConfig::default()
        })
        .expect("reserve heap");
        let mut regions = Vec::new();
        for _ in 0..5 {
            let a = heap.allocate_object(Affiliation::Old, 4, 0).expect("old room");
            heap.allocate_object(Affiliation::Old, 6, 0).expect("old room");
            heap.allocate_object(Affiliation::Old, 8, 0).expect("old room");
            let rest = heap.region_containing(a).free_words() - 4;
            let b = heap.allocate_object(Affiliation::Old, rest, 0).expect("old room");
            let c = heap.allocate_object(Affiliation::Old, 4, 0).expect("old room");
            for obj in [a, b, c] {
                heap.roots().add(obj);
            }
            regions.push(heap.region_containing(a).index());
        }
        // Equal liveness ranks candidates by region index.
        regions.sort_unstable();
        (Arc::new(heap), regions)
    }

    fn is_filled(heap: &GenerationalHeap, index: usize) -> bool {
        let at = heap.region(index).bottom().to_usize() + 4;
        let class = class_word(heap.words(), at);
        class.is_filler() && class.size() == 14
    }

    #[test]
    fn test_transition_table() {
        use OldPhase::*;
        assert!(Idle.can_transition_to(Marking));
        assert!(Idle.can_transition_to(CoalesceAndFill));
        assert!(Marking.can_transition_to(EarlyCleanup));
        assert!(CoalesceAndFill.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(EvacuationReady));
        assert!(!WeakRoots.can_transition_to(CoalesceAndFill));
        assert!(!CoalesceAndFill.can_transition_to(Marking));
    }

    #[test]
    fn test_cycle_without_preemption_completes() {
        let (heap, regions) = heap_with_five_old_regions();
        let driver = OldGc::new(Arc::clone(&heap));
        assert_eq!(driver.candidate_capacity(), 16);

        assert!(driver.collect(GcCause::Explicit));
        assert_eq!(driver.phase(), OldPhase::EvacuationReady);
        assert_eq!(driver.degen_point(), DegenPoint::Unset);
        let state = heap.gc_state();
        assert!(!state.is_concurrent_prep_for_mixed_evacuation_in_progress());
        assert_eq!(state.old_preemption().state(), GuardState::Disallowed);
        assert!(regions.iter().all(|&i| is_filled(&heap, i)));
        assert!(heap.old().task_queues().is_none());
        assert!(heap.young().old_gen_task_queues().is_none());

        let metrics = driver.last_metrics().expect("metrics recorded");
        assert_eq!(metrics.outcome, CycleOutcome::Completed);
        assert_eq!(metrics.regions_filled, 5);
        assert!(!metrics.resumed);
        Verifier::new(&heap).verify_old_regions_parsable();
    }

    #[test]
    fn test_preempted_fill_resumes_with_remaining_regions() {
        let (heap, regions) = heap_with_five_old_regions();
        let driver = OldGc::new(Arc::clone(&heap));
        for &i in &regions[3..] {
            heap.region(i).inject_preemption();
        }

        assert!(!driver.collect(GcCause::OldTrigger));
        let state = heap.gc_state();
        // Stopped without a cancellation, so no degenerated cycle is owed.
        assert_eq!(driver.degen_point(), DegenPoint::Unset);
        assert_eq!(driver.phase(), OldPhase::Idle);
        assert!(state.is_concurrent_prep_for_mixed_evacuation_in_progress());
        assert_eq!(state.old_preemption().state(), GuardState::Disallowed);
        assert_eq!(
            driver.last_metrics().map(|m| m.outcome),
            Some(CycleOutcome::Preempted)
        );
        for &i in &regions[..3] {
            assert!(is_filled(&heap, i));
        }
        for &i in &regions[3..] {
            assert!(!is_filled(&heap, i));
        }

        let mut remaining = Vec::new();
        heap.old_heuristics()
            .get_coalesce_and_fill_candidates(&heap, &mut remaining);
        assert_eq!(remaining, regions[3..].to_vec());

        assert!(driver.collect(GcCause::OldTrigger));
        assert!(!state.is_concurrent_prep_for_mixed_evacuation_in_progress());
        assert!(regions.iter().all(|&i| is_filled(&heap, i)));
        let metrics = driver.last_metrics().expect("metrics recorded");
        assert!(metrics.resumed);
        assert_eq!(metrics.regions_filled, 2);
        assert!(metrics.phases.mark.is_zero());
    }

    /// Runs tasks on real threads, cancelling the cycle right before filling.
    struct CancelBeforeFill {
        pool: WorkerThreads,
        heap: Arc<GenerationalHeap>,
    }

    impl WorkerPool for CancelBeforeFill {
        fn active_workers(&self) -> usize {
            self.pool.active_workers()
        }

        fn run_task(&self, task: &dyn WorkerTask) {
            if task.name().starts_with("Coalescing") {
                self.heap.gc_state().cancel_gc(GcCause::YoungPreemption);
            }
            self.pool.run_task(task);
        }
    }

    #[test]
    fn test_cancelled_fill_degenerates_outside_cycle() {
        let (heap, regions) = heap_with_five_old_regions();
        let driver = OldGc::with_collaborators(
            Arc::clone(&heap),
            Box::new(CancelBeforeFill {
                pool: WorkerThreads::new(2),
                heap: Arc::clone(&heap),
            }),
            Box::new(ParallelMark::new()),
            Box::new(HeapLockSafepoint),
        );

        assert!(!driver.collect(GcCause::OldTrigger));
        assert_eq!(driver.degen_point(), DegenPoint::OutsideCycle);
        assert_eq!(driver.phase(), OldPhase::Idle);
        assert_eq!(
            driver.last_metrics().map(|m| m.outcome),
            Some(CycleOutcome::Preempted)
        );
        let state = heap.gc_state();
        assert!(state.is_concurrent_prep_for_mixed_evacuation_in_progress());
        assert_eq!(state.old_preemption().state(), GuardState::Disallowed);
        assert!(regions.iter().all(|&i| !is_filled(&heap, i)));

        state.clear_cancelled_gc();
        let driver = OldGc::new(Arc::clone(&heap));
        assert!(driver.collect(GcCause::OldTrigger));
        assert!(regions.iter().all(|&i| is_filled(&heap, i)));
    }

    #[test]
    fn test_cancelled_mark_aborts_before_fill() {
        let (heap, regions) = heap_with_five_old_regions();
        let driver = OldGc::new(Arc::clone(&heap));
        heap.gc_state().cancel_gc(GcCause::AllocationFailure);

        assert!(!driver.collect(GcCause::OldTrigger));
        assert_eq!(driver.degen_point(), DegenPoint::Mark);
        assert_eq!(driver.phase(), OldPhase::Idle);
        assert!(!heap
            .gc_state()
            .is_concurrent_prep_for_mixed_evacuation_in_progress());
        assert!(regions.iter().all(|&i| !is_filled(&heap, i)));

        heap.gc_state().clear_cancelled_gc();
        assert!(driver.collect(GcCause::OldTrigger));
    }

    #[test]
    fn test_dead_regions_are_reclaimed_early() {
        let (heap, _) = heap_with_five_old_regions();
        let garbage = heap.allocate_object(Affiliation::Old, 256, 0).expect("old room");
        let index = heap.region_containing(garbage).index();
        let affiliated = heap.old().affiliated_region_count();

        let driver = OldGc::new(Arc::clone(&heap));
        assert!(driver.collect(GcCause::Explicit));
        assert!(heap.region(index).is_empty());
        assert_eq!(heap.old().affiliated_region_count(), affiliated - 1);
    }

    #[test]
    fn test_weak_slots_to_dead_objects_are_cleared() {
        let (heap, _) = heap_with_five_old_regions();
        let live = heap.roots().get(0).expect("rooted");
        let dead = live.offset(4);
        let live_slot = heap.weak_refs().register(live);
        let dead_slot = heap.weak_refs().register(dead);

        let driver = OldGc::new(Arc::clone(&heap));
        assert!(driver.collect(GcCause::Explicit));
        assert_eq!(heap.weak_refs().get(live_slot), Some(live));
        assert_eq!(heap.weak_refs().get(dead_slot), None);
        assert!(!heap.gc_state().is_concurrent_weak_root_in_progress());
    }

    #[test]
    #[should_panic(expected = "no forwarded objects")]
    fn test_forwarded_objects_at_final_mark_are_fatal() {
        let (heap, _) = heap_with_five_old_regions();
        heap.gc_state().set_has_forwarded_objects(true);
        let _ = OldGc::new(heap).collect(GcCause::Explicit);
    }

    #[test]
    fn test_post_mark_verification_toggle() {
        let heap = GenerationalHeap::new(HeapConfig {
            region_words: 256,
            num_regions: 8,
            max_tlab_words: 256,
            verify: true,
            verify_after_old_mark: true,
            ..HeapConfig::default()
        })
        .expect("reserve heap");
        let obj = heap.allocate_object(Affiliation::Old, 4, 0).expect("old room");
        heap.roots().add(obj);
        let driver = OldGc::new(Arc::new(heap));
        assert!(driver.collect(GcCause::Explicit));
        assert!(heap_marked(&driver, obj));
    }

    fn heap_marked(driver: &OldGc, obj: Address) -> bool {
        let region = driver.heap().region_containing(obj);
        region.is_marked(obj.offset_from(region.bottom()))
    }
}
