//! Parallel coalesce-and-fill of old regions.
//!
//! After old marking, dead objects in old regions are still laid out as
//! objects whose references may point into memory that has since been
//! reused. Remembered-set scanning walks old regions object by object, so
//! every run of dead objects has to be overwritten with one filler before
//! the mark bitmap is reset by the next old cycle.
//!
//! The task splits the candidate list round-robin: worker `w` of `n` takes
//! indices `w, w + n, w + 2n, ...`. No work is stolen and workers never wait
//! for each other. A worker that observes cancellation inside a region sets
//! the shared preempted flag and stops; regions filled before that point stay
//! filled and the rest are offered again by the heuristics on resumption.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::gc::workers::WorkerTask;
use crate::generational::GenerationalHeap;

/// Indices of `0..len` handled by `worker_id` out of `workers`.
///
/// # Panics
///
/// Panics if `worker_id` is not below `workers`: the partition would then
/// hand some indices to two workers.
pub fn worker_indices(worker_id: usize, workers: usize, len: usize) -> impl Iterator<Item = usize> {
    assert!(
        worker_id < workers,
        "worker {worker_id} outside a partition of {workers} workers"
    );
    (worker_id..len).step_by(workers)
}

/// One invocation of coalesce-and-fill over a candidate list.
pub struct CoalesceAndFillTask<'a> {
    heap: &'a GenerationalHeap,
    candidates: &'a [usize],
    workers: usize,
    preempted: AtomicBool,
    filled: AtomicUsize,
    humongous_skipped: AtomicUsize,
    workers_done: AtomicUsize,
}

impl<'a> CoalesceAndFillTask<'a> {
    /// Prepares the task for `workers` workers over region indices
    /// `candidates`.
    #[must_use]
    pub const fn new(heap: &'a GenerationalHeap, candidates: &'a [usize], workers: usize) -> Self {
        Self {
            heap,
            candidates,
            workers,
            preempted: AtomicBool::new(false),
            filled: AtomicUsize::new(0),
            humongous_skipped: AtomicUsize::new(0),
            workers_done: AtomicUsize::new(0),
        }
    }

    /// Whether every candidate was processed.
    ///
    /// # Panics
    ///
    /// Panics unless exactly the `workers` this task was built for have run
    /// it. Fewer would leave candidates nobody visited.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        assert_eq!(
            self.workers_done.load(Ordering::Acquire),
            self.workers,
            "coalesce-and-fill was not run by all of its workers"
        );
        !self.preempted.load(Ordering::Acquire)
    }

    /// Regions filled to completion by this invocation.
    #[must_use]
    pub fn regions_filled(&self) -> usize {
        self.filled.load(Ordering::Relaxed)
    }

    /// Humongous candidates passed over.
    #[must_use]
    pub fn humongous_skipped(&self) -> usize {
        self.humongous_skipped.load(Ordering::Relaxed)
    }
}

impl WorkerTask for CoalesceAndFillTask<'_> {
    fn name(&self) -> &'static str {
        "Coalescing and filling (Old)"
    }

    fn work(&self, worker_id: usize) {
        let cancel = Some(self.heap.gc_state());
        for index in worker_indices(worker_id, self.workers, self.candidates.len()) {
            let region = self.heap.region(self.candidates[index]);
            if region.is_humongous() {
                // A humongous region holds one object and no gaps.
                self.humongous_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if !region.oop_coalesce_and_fill(cancel) {
                self.preempted.store(true, Ordering::Release);
                break;
            }
            self.filled.fetch_add(1, Ordering::Relaxed);
        }
        self.workers_done.fetch_add(1, Ordering::AcqRel);
    }
}
