//! Young and old generations.
//!
//! A generation owns no memory directly. It counts the regions affiliated
//! with it, the words used in them, and its capacity in regions. Capacity can
//! move between generations, but the two capacities always add up to the
//! number of regions in the heap.

use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use crate::heap::HeapLocker;
use crate::object::Address;
use crate::region::Affiliation;

/// Which generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationKind {
    Young,
    Old,
}

impl GenerationKind {
    #[must_use]
    pub const fn affiliation(self) -> Affiliation {
        match self {
            Self::Young => Affiliation::Young,
            Self::Old => Affiliation::Old,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Young => "young",
            Self::Old => "old",
        }
    }
}

/// Per-worker mark stacks.
///
/// Workers push to and pop from their own queue and steal from the others
/// once it runs dry.
#[derive(Debug)]
pub struct TaskQueueSet {
    queues: Box<[SegQueue<Address>]>,
}

impl TaskQueueSet {
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            queues: (0..workers.max(1)).map(|_| SegQueue::new()).collect(),
        }
    }

    /// Number of per-worker queues.
    #[must_use]
    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }

    /// Objects waiting in all queues.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.iter().map(SegQueue::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(SegQueue::is_empty)
    }

    pub fn push(&self, worker: usize, obj: Address) {
        self.queues[worker % self.queues.len()].push(obj);
    }

    /// Pops from `worker`'s own queue, then tries the others in order.
    #[must_use]
    pub fn pop_or_steal(&self, worker: usize) -> Option<Address> {
        let n = self.queues.len();
        let own = worker % n;
        if let Some(obj) = self.queues[own].pop() {
            return Some(obj);
        }
        (1..n).find_map(|i| self.queues[(own + i) % n].pop())
    }
}

/// One generation's accounting.
#[derive(Debug)]
pub struct Generation {
    kind: GenerationKind,
    region_words: usize,
    affiliated_regions: AtomicUsize,
    used: AtomicUsize,
    capacity_regions: AtomicUsize,
    evacuation_reserve: AtomicUsize,
    promoted_reserve: AtomicUsize,
    promoted_expended: AtomicUsize,
    promotion_potential: AtomicUsize,
    region_balance: AtomicIsize,
    failed_promotions: AtomicUsize,
    failed_promotion_words: AtomicUsize,
    failed_evacuation: AtomicBool,
    cannot_expand: AtomicBool,
    task_queues: Mutex<Option<Arc<TaskQueueSet>>>,
    old_gen_task_queues: Mutex<Option<Arc<TaskQueueSet>>>,
}

impl Generation {
    pub(crate) const fn new(kind: GenerationKind, capacity_regions: usize, region_words: usize) -> Self {
        Self {
            kind,
            region_words,
            affiliated_regions: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
            capacity_regions: AtomicUsize::new(capacity_regions),
            evacuation_reserve: AtomicUsize::new(0),
            promoted_reserve: AtomicUsize::new(0),
            promoted_expended: AtomicUsize::new(0),
            promotion_potential: AtomicUsize::new(0),
            region_balance: AtomicIsize::new(0),
            failed_promotions: AtomicUsize::new(0),
            failed_promotion_words: AtomicUsize::new(0),
            failed_evacuation: AtomicBool::new(false),
            cannot_expand: AtomicBool::new(false),
            task_queues: Mutex::new(None),
            old_gen_task_queues: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> GenerationKind {
        self.kind
    }

    #[must_use]
    pub fn is_old(&self) -> bool {
        self.kind == GenerationKind::Old
    }

    // ------------------------------------------------------------------------
    // Capacity and usage
    // ------------------------------------------------------------------------

    #[must_use]
    pub fn affiliated_region_count(&self) -> usize {
        self.affiliated_regions.load(Ordering::Acquire)
    }

    pub(crate) fn increment_affiliated_region_count(&self, _lock: &HeapLocker<'_>) {
        self.affiliated_regions.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrement_affiliated_region_count(&self, _lock: &HeapLocker<'_>) {
        let prev = self.affiliated_regions.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "{} affiliated region count underflow", self.kind.label());
    }

    /// Capacity in regions.
    #[must_use]
    pub fn max_capacity_regions(&self) -> usize {
        self.capacity_regions.load(Ordering::Acquire)
    }

    /// Capacity in words.
    #[must_use]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity_regions() * self.region_words
    }

    pub(crate) fn increase_capacity(&self, _lock: &HeapLocker<'_>, regions: usize) {
        self.capacity_regions.fetch_add(regions, Ordering::AcqRel);
    }

    pub(crate) fn decrease_capacity(&self, _lock: &HeapLocker<'_>, regions: usize) {
        let prev = self.capacity_regions.fetch_sub(regions, Ordering::AcqRel);
        debug_assert!(prev >= regions, "{} capacity underflow", self.kind.label());
    }

    /// Words allocated in affiliated regions.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub(crate) fn increase_used(&self, words: usize) {
        self.used.fetch_add(words, Ordering::AcqRel);
    }

    pub(crate) fn decrease_used(&self, words: usize) {
        let prev = self.used.fetch_sub(words, Ordering::AcqRel);
        debug_assert!(prev >= words, "{} used underflow", self.kind.label());
    }

    /// Words this generation may still allocate.
    #[must_use]
    pub fn available(&self) -> usize {
        self.max_capacity().saturating_sub(self.used())
    }

    /// Capacity not backed by an affiliated region yet.
    #[must_use]
    pub fn free_unaffiliated_regions(&self) -> usize {
        self.max_capacity_regions()
            .saturating_sub(self.affiliated_region_count())
    }

    // ------------------------------------------------------------------------
    // Reserves
    // ------------------------------------------------------------------------

    #[must_use]
    pub fn evacuation_reserve(&self) -> usize {
        self.evacuation_reserve.load(Ordering::Acquire)
    }

    pub fn set_evacuation_reserve(&self, words: usize) {
        self.evacuation_reserve.store(words, Ordering::Release);
    }

    #[must_use]
    pub fn promoted_reserve(&self) -> usize {
        self.promoted_reserve.load(Ordering::Acquire)
    }

    pub fn set_promoted_reserve(&self, words: usize) {
        self.promoted_reserve.store(words, Ordering::Release);
    }

    #[must_use]
    pub fn promoted_expended(&self) -> usize {
        self.promoted_expended.load(Ordering::Acquire)
    }

    pub fn reset_promoted_expended(&self) {
        self.promoted_expended.store(0, Ordering::Release);
    }

    /// Whether `words` more can be promoted within the reserve.
    #[must_use]
    pub fn can_promote(&self, words: usize) -> bool {
        self.promoted_expended() + words <= self.promoted_reserve()
    }

    /// Charges `words` against the promotion reserve if they fit. The check
    /// and the charge are one step, so concurrent callers never overdraw.
    pub(crate) fn try_expend_promoted(&self, words: usize) -> bool {
        let reserve = self.promoted_reserve();
        self.promoted_expended
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |expended| {
                expended
                    .checked_add(words)
                    .filter(|&total| total <= reserve)
            })
            .is_ok()
    }

    pub(crate) fn unexpend_promoted(&self, words: usize) {
        let _ = self
            .promoted_expended
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |e| {
                Some(e.saturating_sub(words))
            });
    }

    /// Words of young objects old enough to promote at the next evacuation.
    #[must_use]
    pub fn promotion_potential(&self) -> usize {
        self.promotion_potential.load(Ordering::Acquire)
    }

    pub fn set_promotion_potential(&self, words: usize) {
        self.promotion_potential.store(words, Ordering::Release);
    }

    /// Regions to give (positive) or take (negative) at the next balance.
    #[must_use]
    pub fn region_balance(&self) -> isize {
        self.region_balance.load(Ordering::Acquire)
    }

    pub fn set_region_balance(&self, balance: isize) {
        self.region_balance.store(balance, Ordering::Release);
    }

    // ------------------------------------------------------------------------
    // Failure bookkeeping
    // ------------------------------------------------------------------------

    pub(crate) fn handle_failed_promotion(&self, words: usize) {
        self.failed_promotions.fetch_add(1, Ordering::Relaxed);
        self.failed_promotion_words.fetch_add(words, Ordering::Relaxed);
    }

    #[must_use]
    pub fn failed_promotions(&self) -> (usize, usize) {
        (
            self.failed_promotions.load(Ordering::Relaxed),
            self.failed_promotion_words.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn handle_failed_evacuation(&self) {
        self.failed_evacuation.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn has_failed_evacuation(&self) -> bool {
        self.failed_evacuation.load(Ordering::Acquire)
    }

    /// A transfer into this generation was refused.
    pub(crate) fn handle_failed_transfer(&self) {
        self.cannot_expand.store(true, Ordering::Release);
    }

    /// Reads and clears the failed-transfer flag.
    pub fn take_cannot_expand(&self) -> bool {
        self.cannot_expand.swap(false, Ordering::AcqRel)
    }

    // ------------------------------------------------------------------------
    // Mark queues
    // ------------------------------------------------------------------------

    /// Queues used by the current marking of this generation.
    #[must_use]
    pub fn task_queues(&self) -> Option<Arc<TaskQueueSet>> {
        self.task_queues.lock().clone()
    }

    pub fn set_task_queues(&self, queues: Option<Arc<TaskQueueSet>>) {
        *self.task_queues.lock() = queues;
    }

    /// Young only: the old generation's queues while old marking runs, so young
    /// marking can hand over old objects it reaches.
    #[must_use]
    pub fn old_gen_task_queues(&self) -> Option<Arc<TaskQueueSet>> {
        self.old_gen_task_queues.lock().clone()
    }

    pub fn set_old_gen_task_queues(&self, queues: Option<Arc<TaskQueueSet>>) {
        debug_assert!(
            !self.is_old() || queues.is_none(),
            "the old generation does not borrow its own queues"
        );
        *self.old_gen_task_queues.lock() = queues;
    }
}
