//! Concurrent marking.
//!
//! Marking is a collaborator of the old-generation driver: the driver only
//! needs to start it, run it concurrently (observing cancellation) and finish
//! it at a pause. [`ParallelMark`] is a plain parallel tracer over per-worker
//! [`SegQueue`](crossbeam_queue::SegQueue)s with stealing.
//!
//! Objects at or above a region's TAMS were allocated during marking and are
//! implicitly live; only objects below TAMS add to a region's live words.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::gc::strategy::CollectionStrategy;
use crate::gc::workers::{WorkerPool, WorkerTask};
use crate::generation::TaskQueueSet;
use crate::generational::GenerationalHeap;
use crate::object::{self, Address, HEADER_WORDS};

/// Objects traced between two cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 64;

/// A marking implementation driven by a collector cycle.
pub trait ConcurrentMark: Send + Sync {
    /// Resets mark state and seeds the task queues. Runs at the init-mark pause.
    fn init_mark(&self, heap: &GenerationalHeap, strategy: CollectionStrategy);

    /// Marks concurrently with mutators. Returns `false` if marking observed
    /// cancellation and stopped early.
    fn mark_concurrent(
        &self,
        heap: &GenerationalHeap,
        workers: &dyn WorkerPool,
        strategy: CollectionStrategy,
    ) -> bool;

    /// Completes marking. Runs at the final-mark pause and is not cancellable.
    fn finish_mark(&self, heap: &GenerationalHeap, strategy: CollectionStrategy);
}

/// Parallel tracing marker.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParallelMark;

impl ParallelMark {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn queues(heap: &GenerationalHeap, strategy: CollectionStrategy) -> Option<Arc<TaskQueueSet>> {
        if strategy.marks_old() {
            heap.old().task_queues()
        } else {
            heap.young().task_queues()
        }
    }

    fn seed_roots(heap: &GenerationalHeap, queues: &TaskQueueSet) {
        let mut worker = 0;
        heap.roots().for_each(|obj| {
            queues.push(worker, obj);
            worker += 1;
        });
    }
}

impl ConcurrentMark for ParallelMark {
    fn init_mark(&self, heap: &GenerationalHeap, strategy: CollectionStrategy) {
        for region in heap.regions() {
            if !region.is_active() {
                continue;
            }
            // Old marking also sets bits in young regions it traces through.
            if strategy.marks_old() || region.is_young() {
                region.capture_top_at_mark_start();
            }
        }

        let queues = Arc::new(TaskQueueSet::new(heap.config().workers));
        match strategy {
            CollectionStrategy::Young => heap.young().set_task_queues(Some(Arc::clone(&queues))),
            CollectionStrategy::Old => {
                heap.old().set_task_queues(Some(Arc::clone(&queues)));
                heap.young().set_old_gen_task_queues(Some(Arc::clone(&queues)));
            }
            CollectionStrategy::Global => heap.old().set_task_queues(Some(Arc::clone(&queues))),
        }
        Self::seed_roots(heap, &queues);
    }

    fn mark_concurrent(
        &self,
        heap: &GenerationalHeap,
        workers: &dyn WorkerPool,
        strategy: CollectionStrategy,
    ) -> bool {
        let Some(queues) = Self::queues(heap, strategy) else {
            return !heap.gc_state().cancelled_gc();
        };
        let task = MarkTask {
            heap,
            queues: &queues,
            strategy,
            cancellable: true,
        };
        workers.run_task(&task);
        !heap.gc_state().cancelled_gc()
    }

    fn finish_mark(&self, heap: &GenerationalHeap, strategy: CollectionStrategy) {
        let Some(queues) = Self::queues(heap, strategy) else {
            return;
        };
        // Roots stored since init mark.
        Self::seed_roots(heap, &queues);
        let task = MarkTask {
            heap,
            queues: &queues,
            strategy,
            cancellable: false,
        };
        for worker in 0..queues.num_queues() {
            task.work(worker);
        }
        debug_assert!(queues.is_empty());
    }
}

struct MarkTask<'a> {
    heap: &'a GenerationalHeap,
    queues: &'a TaskQueueSet,
    strategy: CollectionStrategy,
    cancellable: bool,
}

impl MarkTask<'_> {
    fn mark_object(&self, worker: usize, obj: Address) {
        let heap = self.heap;
        let obj = heap.resolve_forwarded(obj);
        let region = heap.region_containing(obj);

        if self.strategy == CollectionStrategy::Young && region.is_old() {
            // Old objects are the old cycle's business; hand them over.
            if let Some(old_queues) = heap.young().old_gen_task_queues() {
                old_queues.push(worker, obj);
            }
            return;
        }

        let offset = obj.offset_from(region.bottom());
        if !region.mark(offset) {
            return;
        }

        let words = heap.words();
        let size = object::object_size(words, obj.to_usize());
        let counts = match self.strategy {
            CollectionStrategy::Young => region.is_young(),
            CollectionStrategy::Old => region.is_old(),
            CollectionStrategy::Global => true,
        };
        if counts && offset < region.tams() {
            region.add_live_words(size);
        }

        let refs = object::class_word(words, obj.to_usize()).refs();
        let first = obj.to_usize() + HEADER_WORDS;
        for slot in &words[first..first + refs] {
            let raw = slot.load(Ordering::Acquire);
            if raw != Address::NULL_SLOT {
                self.queues.push(worker, Address::new(raw));
            }
        }
    }
}

impl WorkerTask for MarkTask<'_> {
    fn name(&self) -> &'static str {
        "Concurrent marking"
    }

    fn work(&self, worker_id: usize) {
        let worker = worker_id % self.queues.num_queues();
        let mut traced = 0;
        while let Some(obj) = self.queues.pop_or_steal(worker) {
            self.mark_object(worker, obj);
            traced += 1;
            if self.cancellable
                && traced % CANCEL_CHECK_INTERVAL == 0
                && self.heap.gc_state().cancelled_gc()
            {
                return;
            }
        }
    }
}
