//! The generational heap.
//!
//! [`GenerationalHeap`] owns the region registry, both generations and the
//! collector signals. Besides plain allocation it implements the parts of a
//! generational collector that sit between cycles:
//!
//! - **balancing**: after a cycle, old computes whether it holds more free
//!   regions than its next evacuations need (surplus, given to young) or fewer
//!   (deficit, taken from young), and the capacity is moved under the heap lock;
//! - **promotion**: GC threads copy survivors through thread-local PLABs in old
//!   and GCLABs in young, installing forwarding pointers with compare-and-swap so
//!   that exactly one copy of each object wins.
//!
//! There is no process-wide heap. Every component receives the heap it works
//! on, so several heaps can coexist in one process.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;
use strata_sys::{align_down, align_up};

use crate::gc::heuristics::{OldGenHeuristics, OldHeuristics};
use crate::gc::roots::RootSet;
use crate::gc::state::{GcCause, GcState};
use crate::gc::strategy::CollectionStrategy;
use crate::gc::weak::WeakRefTable;
use crate::generation::{Generation, GenerationKind};
use crate::heap::{FreeSet, HeapConfig, HeapLocker, RegionRegistry, CARD_WORDS};
use crate::object::{self, Address, HEADER_WORDS};
use crate::plab::{GcThreadLocal, LabBuffer};
use crate::region::{Affiliation, Region};

/// Outcome of [`GenerationalHeap::balance_generations`].
///
/// Computed under the heap lock; log it only after the lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferResult {
    pub success: bool,
    pub region_count: usize,
    pub region_destination: &'static str,
}

impl TransferResult {
    /// Reports the transfer together with both generations' free space.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    pub fn log(&self, when: &str, heap: &GenerationalHeap) {
        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_transfer(
            when,
            self.success,
            self.region_count,
            self.region_destination,
            heap.old().available(),
            heap.young().available(),
        );
    }
}

impl fmt::Display for TransferResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} regions to {}",
            if self.success {
                "successfully transferred"
            } else {
                "failed to transfer"
            },
            self.region_count,
            self.region_destination
        )
    }
}

/// Region-based heap with a young and an old generation.
pub struct GenerationalHeap {
    config: HeapConfig,
    registry: RegionRegistry,
    free_set: Mutex<FreeSet>,
    young: Generation,
    old: Generation,
    gc_state: GcState,
    old_heuristics: Box<dyn OldHeuristics>,
    roots: RootSet,
    weak_refs: WeakRefTable,
    active_strategy: AtomicU8,
    aging_cycle: AtomicBool,
    plab_min_size: usize,
    plab_max_size: usize,
    outstanding_plabs: Mutex<HashSet<LabBuffer>>,
    promoted_words: AtomicUsize,
}

impl fmt::Debug for GenerationalHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationalHeap")
            .field("num_regions", &self.num_regions())
            .field("region_words", &self.region_words())
            .field("young", &self.young)
            .field("old", &self.old)
            .finish_non_exhaustive()
    }
}

impl GenerationalHeap {
    /// Reserves a heap with the default old-generation heuristics.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the heap cannot be reserved.
    ///
    /// # Panics
    ///
    /// Panics if `config` does not pass [`HeapConfig::validate`].
    pub fn new(config: HeapConfig) -> io::Result<Self> {
        let heuristics = Box::new(OldGenHeuristics::new(&config));
        Self::with_old_heuristics(config, heuristics)
    }

    /// Reserves a heap that uses `old_heuristics` to choose old candidates.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the heap cannot be reserved.
    ///
    /// # Panics
    ///
    /// Panics if `config` does not pass [`HeapConfig::validate`].
    pub fn with_old_heuristics(
        config: HeapConfig,
        old_heuristics: Box<dyn OldHeuristics>,
    ) -> io::Result<Self> {
        config.validate();
        let registry = RegionRegistry::new(&config)?;
        let old_regions = config.initial_old_regions();
        let young_regions = config.num_regions - old_regions;
        Ok(Self {
            free_set: Mutex::new(FreeSet::new(config.num_regions)),
            young: Generation::new(GenerationKind::Young, young_regions, config.region_words),
            old: Generation::new(GenerationKind::Old, old_regions, config.region_words),
            gc_state: GcState::new(),
            old_heuristics,
            roots: RootSet::new(),
            weak_refs: WeakRefTable::new(),
            active_strategy: AtomicU8::new(CollectionStrategy::Young as u8),
            aging_cycle: AtomicBool::new(false),
            plab_min_size: Self::calculate_min_plab(&config),
            plab_max_size: Self::calculate_max_plab(&config),
            outstanding_plabs: Mutex::new(HashSet::new()),
            promoted_words: AtomicUsize::new(0),
            registry,
            config,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    #[must_use]
    pub const fn registry(&self) -> &RegionRegistry {
        &self.registry
    }

    /// Every heap word, indexed by [`Address`].
    #[must_use]
    pub fn words(&self) -> &[std::sync::atomic::AtomicUsize] {
        self.registry.words()
    }

    #[must_use]
    pub fn region(&self, index: usize) -> &Region {
        self.registry.region(index)
    }

    #[must_use]
    pub fn regions(&self) -> &[Region] {
        self.registry.regions()
    }

    #[must_use]
    pub fn num_regions(&self) -> usize {
        self.registry.num_regions()
    }

    #[must_use]
    pub const fn region_words(&self) -> usize {
        self.registry.region_words()
    }

    #[must_use]
    pub fn region_containing(&self, addr: Address) -> &Region {
        self.registry.region_containing(addr)
    }

    #[must_use]
    pub const fn young(&self) -> &Generation {
        &self.young
    }

    #[must_use]
    pub const fn old(&self) -> &Generation {
        &self.old
    }

    /// Generation owning regions of `affiliation`.
    ///
    /// # Panics
    ///
    /// Panics for [`Affiliation::Free`].
    #[must_use]
    pub fn generation(&self, affiliation: Affiliation) -> &Generation {
        match affiliation {
            Affiliation::Young => &self.young,
            Affiliation::Old => &self.old,
            Affiliation::Free => panic!("free regions belong to no generation"),
        }
    }

    #[must_use]
    pub const fn gc_state(&self) -> &GcState {
        &self.gc_state
    }

    #[must_use]
    pub fn old_heuristics(&self) -> &dyn OldHeuristics {
        &*self.old_heuristics
    }

    /// Strong roots.
    #[must_use]
    pub const fn roots(&self) -> &RootSet {
        &self.roots
    }

    /// Weak references.
    #[must_use]
    pub const fn weak_refs(&self) -> &WeakRefTable {
        &self.weak_refs
    }

    /// Takes the heap lock.
    pub fn lock(&self) -> HeapLocker<'_> {
        HeapLocker::new(self.free_set.lock())
    }

    /// Generation the running cycle collects.
    #[must_use]
    pub fn active_strategy(&self) -> CollectionStrategy {
        CollectionStrategy::from_u8(self.active_strategy.load(Ordering::Acquire))
    }

    pub fn set_active_strategy(&self, strategy: CollectionStrategy) {
        self.active_strategy.store(strategy as u8, Ordering::Release);
    }

    /// Whether young survivors grow older in this cycle.
    #[must_use]
    pub fn is_aging_cycle(&self) -> bool {
        self.aging_cycle.load(Ordering::Acquire)
    }

    pub fn set_aging_cycle(&self, aging: bool) {
        self.aging_cycle.store(aging, Ordering::Release);
    }

    /// Words promoted into old since the heap was created.
    #[must_use]
    pub fn promoted_words(&self) -> usize {
        self.promoted_words.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    fn new_region(&self, lock: &mut HeapLocker<'_>, affiliation: Affiliation) -> Option<usize> {
        let generation = self.generation(affiliation);
        if generation.free_unaffiliated_regions() == 0 {
            return None;
        }
        let index = lock.take_empty(affiliation)?;
        self.region(index).make_regular(lock, affiliation);
        generation.increment_affiliated_region_count(lock);
        Some(index)
    }

    fn allocate_under_lock(
        &self,
        lock: &mut HeapLocker<'_>,
        affiliation: Affiliation,
        size: usize,
    ) -> Option<Address> {
        let generation = self.generation(affiliation);
        if let Some(index) = lock.alloc_region(affiliation) {
            if let Some(obj) = self.region(index).allocate(lock, size) {
                generation.increase_used(size);
                return Some(obj);
            }
        }
        let index = self.new_region(lock, affiliation)?;
        lock.set_alloc_region(affiliation, Some(index));
        let obj = self.region(index).allocate(lock, size)?;
        generation.increase_used(size);
        Some(obj)
    }

    /// Allocates an object of `size` words with `refs` reference slots in a
    /// region of `affiliation`.
    ///
    /// # Panics
    ///
    /// Panics if the object is humongous or `affiliation` is free.
    pub fn allocate_object(&self, affiliation: Affiliation, size: usize, refs: usize) -> Option<Address> {
        assert!(
            size <= self.config.humongous_threshold_words(),
            "object of {size} words is humongous"
        );
        let mut lock = self.lock();
        let obj = self.allocate_under_lock(&mut lock, affiliation, size)?;
        object::write_object(self.words(), obj.to_usize(), size, refs);
        Some(obj)
    }

    /// Allocates an object spanning a run of dedicated regions.
    pub fn allocate_humongous(&self, affiliation: Affiliation, size: usize, refs: usize) -> Option<Address> {
        let region_words = self.region_words();
        let count = size.div_ceil(region_words);
        let generation = self.generation(affiliation);

        let mut lock = self.lock();
        if generation.free_unaffiliated_regions() < count {
            return None;
        }
        let first = lock.take_contiguous(count)?;
        for (i, index) in (first..first + count).enumerate() {
            let region = self.region(index);
            if i == 0 {
                region.make_humongous_start(&lock, affiliation);
            } else {
                region.make_humongous_cont(&lock, affiliation);
            }
            region.set_top(&lock, (size - i * region_words).min(region_words));
            generation.increment_affiliated_region_count(&lock);
        }
        generation.increase_used(size);
        let obj = self.region(first).bottom();
        object::write_object(self.words(), obj.to_usize(), size, refs);
        Some(obj)
    }

    /// Largest TLAB a mutator could get right now, read without coordination.
    #[must_use]
    pub fn unsafe_max_tlab_alloc(&self) -> usize {
        let lock = self.lock();
        let in_alloc_region = lock
            .alloc_region(Affiliation::Young)
            .map_or(0, |i| self.region(i).free_words());
        let fresh = if self.young.free_unaffiliated_regions() > 0 && lock.empty_regions() > 0 {
            self.region_words()
        } else {
            0
        };
        in_alloc_region.max(fresh).min(self.config.max_tlab_words)
    }

    // ========================================================================
    // References
    // ========================================================================

    fn ref_slot(&self, obj: Address, slot: usize) -> usize {
        let class = object::class_word(self.words(), obj.to_usize());
        assert!(
            slot < class.refs(),
            "slot {slot} out of range for object {obj} with {} references",
            class.refs()
        );
        obj.to_usize() + HEADER_WORDS + slot
    }

    /// Stores `value` in reference slot `slot` of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if the object has no such slot.
    pub fn write_ref(&self, obj: Address, slot: usize, value: Option<Address>) {
        let obj = self.resolve_forwarded(obj);
        let at = self.ref_slot(obj, slot);
        let raw = value.map_or(Address::NULL_SLOT, Address::to_usize);
        self.words()[at].store(raw, Ordering::Release);
    }

    /// Loads reference slot `slot` of `obj`, resolving forwarded referents.
    ///
    /// # Panics
    ///
    /// Panics if the object has no such slot.
    #[must_use]
    pub fn read_ref(&self, obj: Address, slot: usize) -> Option<Address> {
        let obj = self.resolve_forwarded(obj);
        let raw = self.words()[self.ref_slot(obj, slot)].load(Ordering::Acquire);
        (raw != Address::NULL_SLOT).then(|| self.resolve_forwarded(Address::new(raw)))
    }

    /// The canonical copy of `obj`.
    #[must_use]
    pub fn resolve_forwarded(&self, obj: Address) -> Address {
        object::mark_word(self.words(), obj.to_usize())
            .forwardee()
            .unwrap_or(obj)
    }

    // ========================================================================
    // Region reclamation
    // ========================================================================

    /// Trashes a dead humongous object's regions. Returns how many.
    pub(crate) fn trash_humongous_region_at(&self, lock: &HeapLocker<'_>, start: usize) -> usize {
        debug_assert!(self.region(start).is_humongous_start());
        self.region(start).make_trash(lock);
        let mut count = 1;
        while start + count < self.num_regions()
            && self.region(start + count).state() == crate::region::RegionState::HumongousCont
        {
            self.region(start + count).make_trash(lock);
            count += 1;
        }
        count
    }

    /// Returns trashed regions to the free set. Returns how many.
    pub fn recycle_trash(&self, lock: &mut HeapLocker<'_>) -> usize {
        let mut recycled = 0;
        for region in self.regions() {
            if !region.is_trash() {
                continue;
            }
            let generation = self.generation(region.affiliation());
            generation.decrease_used(region.used_words());
            generation.decrement_affiliated_region_count(lock);
            region.recycle(lock);
            lock.release(region.index());
            if let Err(_err) = self.registry.uncommit_region(region.index()) {
                #[cfg(feature = "tracing")]
                tracing::warn!(region = region.index(), error = %_err, "uncommit_failed");
            }
            recycled += 1;
        }
        recycled
    }

    /// Logs free space of both generations.
    pub fn log_free_set_status(&self) {
        let _empty = self.lock().empty_regions();
        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_free_set(_empty, self.young.available(), self.old.available());
    }

    // ========================================================================
    // Generation balance
    // ========================================================================

    /// Zeroes every evacuation and promotion reserve.
    ///
    /// Must run before [`compute_old_generation_balance`](Self::compute_old_generation_balance).
    pub fn reset_generation_reserves(&self) {
        self.young.set_evacuation_reserve(0);
        self.old.set_evacuation_reserve(0);
        self.old.set_promoted_reserve(0);
    }

    /// Decides how many regions old can give to young, or needs from it.
    ///
    /// All quantities are words. `transfer_limit` caps what old may take from
    /// young; `cset_regions` counts old regions in the collection set, which
    /// become free once evacuated. The result is stored as old's region
    /// balance and applied by [`balance_generations`](Self::balance_generations).
    ///
    /// With `R` the share of total evacuation that may target old, young
    /// reserve `YE` bounds old evacuation at `OE = YE * R / (100 - R)`.
    pub fn compute_old_generation_balance(&self, transfer_limit: usize, cset_regions: usize) {
        debug_assert_eq!(self.old.evacuation_reserve(), 0, "reserves must be reset first");
        debug_assert_eq!(self.old.promoted_reserve(), 0, "reserves must be reset first");

        let config = &self.config;
        let region_words = self.region_words();
        let ratio = config.old_evac_ratio_percent;

        let old_available = self.old.available();
        let young_reserve = self.young.max_capacity() * config.evac_reserve_percent / 100;

        let bound_on_old_reserve = old_available + transfer_limit + young_reserve;
        let max_old_reserve = if ratio == 100 {
            bound_on_old_reserve
        } else {
            (young_reserve * ratio / (100 - ratio)).min(bound_on_old_reserve)
        };

        let mut reserve_for_mixed = 0;
        if self.old_heuristics.unprocessed_old_collection_candidates() > 0 {
            let max_evac_need =
                self.old_heuristics.unprocessed_candidates_live_words() * config.old_evac_waste_percent / 100;
            let unaffiliated = self.old.free_unaffiliated_regions() * region_words;
            debug_assert!(old_available >= unaffiliated, "unaffiliated exceeds available");
            let old_fragmented_available = old_available.saturating_sub(unaffiliated);
            reserve_for_mixed = (max_evac_need + old_fragmented_available).min(max_old_reserve);
        }

        let mut reserve_for_promo = 0;
        let promo_load = self.old.promotion_potential();
        if promo_load > 0 {
            let available_for_promotions = max_old_reserve - reserve_for_mixed;
            reserve_for_promo =
                (promo_load * config.promo_evac_waste_percent / 100).min(available_for_promotions);
        }

        let old_reserve = reserve_for_mixed + reserve_for_promo;
        debug_assert!(old_reserve <= max_old_reserve);

        let max_old_available = old_available + cset_regions * region_words;
        let balance = if max_old_available >= old_reserve {
            let old_surplus = (max_old_available - old_reserve) / region_words;
            let unaffiliated_old_regions = self.old.free_unaffiliated_regions() + cset_regions;
            to_isize(old_surplus.min(unaffiliated_old_regions))
        } else {
            let old_need = (old_reserve - max_old_available).div_ceil(region_words);
            let max_old_region_transfer = transfer_limit / region_words;
            -to_isize(old_need.min(max_old_region_transfer))
        };
        self.old.set_region_balance(balance);

        self.young.set_evacuation_reserve(young_reserve);
        self.old.set_evacuation_reserve(reserve_for_mixed);
        self.old.set_promoted_reserve(reserve_for_promo);
    }

    /// Moves the capacity decided by the last balance computation.
    ///
    /// The caller holds the heap lock; the returned record should be logged
    /// after releasing it.
    pub fn balance_generations(&self, lock: &mut HeapLocker<'_>) -> TransferResult {
        let balance = self.old.region_balance();
        self.old.set_region_balance(0);

        if balance > 0 {
            let surplus = balance.unsigned_abs();
            let success = self.transfer_regions(lock, &self.old, &self.young, surplus);
            return TransferResult {
                success,
                region_count: surplus,
                region_destination: "young",
            };
        }

        if balance < 0 {
            let deficit = balance.unsigned_abs();
            let success = self.transfer_regions(lock, &self.young, &self.old, deficit);
            if !success {
                self.old.handle_failed_transfer();
            }
            return TransferResult {
                success,
                region_count: deficit,
                region_destination: "old",
            };
        }

        TransferResult {
            success: true,
            region_count: 0,
            region_destination: "none",
        }
    }

    fn min_regions_for(&self, generation: &Generation) -> usize {
        if generation.is_old() {
            self.num_regions() - self.config.max_young_regions()
        } else {
            self.config.min_young_regions()
        }
    }

    fn max_regions_for(&self, generation: &Generation) -> usize {
        if generation.is_old() {
            self.num_regions() - self.config.min_young_regions()
        } else {
            self.config.max_young_regions()
        }
    }

    fn transfer_regions(
        &self,
        lock: &HeapLocker<'_>,
        src: &Generation,
        dst: &Generation,
        regions: usize,
    ) -> bool {
        if src.free_unaffiliated_regions() < regions {
            return false;
        }
        if dst.max_capacity_regions() + regions > self.max_regions_for(dst) {
            return false;
        }
        if src.max_capacity_regions() < self.min_regions_for(src) + regions {
            return false;
        }
        src.decrease_capacity(lock, regions);
        dst.increase_capacity(lock, regions);
        true
    }

    // ========================================================================
    // Thread-local buffers
    // ========================================================================

    /// Smallest PLAB: the configured minimum rounded up to a card.
    #[must_use]
    pub const fn calculate_min_plab(config: &HeapConfig) -> usize {
        align_up(config.plab_min_words, CARD_WORDS)
    }

    /// Largest PLAB: the TLAB limit, or `max_evac_lab_ratio` times the minimum
    /// when that is smaller, rounded down to a card and never below the minimum.
    #[must_use]
    pub fn calculate_max_plab(config: &HeapConfig) -> usize {
        let max = if config.max_evac_lab_ratio > 0 {
            align_down(
                config
                    .max_tlab_words
                    .min(config.plab_min_words * config.max_evac_lab_ratio),
                CARD_WORDS,
            )
        } else {
            align_down(config.max_tlab_words, CARD_WORDS)
        };
        max.max(Self::calculate_min_plab(config))
    }

    #[must_use]
    pub const fn plab_min_size(&self) -> usize {
        self.plab_min_size
    }

    #[must_use]
    pub const fn plab_max_size(&self) -> usize {
        self.plab_max_size
    }

    /// Carves a buffer of at least `min_size` and at most `desired` words from
    /// a region of `affiliation`, rounded down to `align`.
    fn allocate_lab(
        &self,
        lock: &mut HeapLocker<'_>,
        affiliation: Affiliation,
        min_size: usize,
        desired: usize,
        align: usize,
    ) -> Option<LabBuffer> {
        let generation = self.generation(affiliation);
        let fits = |region: &Region| {
            let size = align_down(desired.min(region.free_words()), align);
            (size >= min_size).then_some(size)
        };

        let current = lock
            .alloc_region(affiliation)
            .and_then(|i| fits(self.region(i)).map(|size| (i, size)));
        let (index, size) = match current {
            Some(found) => found,
            None => {
                let index = self.new_region(lock, affiliation)?;
                lock.set_alloc_region(affiliation, Some(index));
                (index, fits(self.region(index))?)
            }
        };

        let start = self.region(index).allocate(lock, size)?;
        generation.increase_used(size);
        Some(LabBuffer {
            start,
            end: start.offset(size),
        })
    }

    /// Allocates a fresh PLAB in old of `min_size..=word_size` words.
    ///
    /// The buffer is tracked until retired.
    pub fn allocate_new_plab(&self, min_size: usize, word_size: usize) -> Option<LabBuffer> {
        debug_assert_eq!(min_size % CARD_WORDS, 0, "PLAB minimum is card aligned");
        debug_assert!(word_size >= min_size, "requested PLAB is too small");
        let buffer = {
            let mut lock = self.lock();
            self.allocate_lab(&mut lock, Affiliation::Old, min_size, word_size, CARD_WORDS)?
        };
        self.outstanding_plabs.lock().insert(buffer);
        Some(buffer)
    }

    /// Fast-path allocation from the thread's PLAB.
    ///
    /// Returns `None` to send the caller to a shared allocation, either because
    /// promotions are disabled for this thread or because the current PLAB
    /// still has plenty of room and should not be retired for this object.
    pub fn allocate_from_plab(
        &self,
        tl: &mut GcThreadLocal,
        size: usize,
        is_promotion: bool,
    ) -> Option<Address> {
        if is_promotion && !tl.allow_plab_promotions {
            return None;
        }
        let mut obj = tl.plab.allocate(size);
        if obj.is_none() && tl.plab.words_remaining() < self.plab_min_size {
            obj = self.allocate_from_plab_slow(tl, size, is_promotion);
        }
        let obj = obj?;
        if is_promotion {
            tl.plab_promoted += size;
        }
        Some(obj)
    }

    /// Retires the thread's PLAB and installs a new one, doubling the desired
    /// size at each refill up to [`plab_max_size`](Self::plab_max_size).
    pub fn allocate_from_plab_slow(
        &self,
        tl: &mut GcThreadLocal,
        size: usize,
        is_promotion: bool,
    ) -> Option<Address> {
        let plab_min_size = self.plab_min_size;
        let min_size = if size > plab_min_size {
            align_up(size, CARD_WORDS)
        } else {
            plab_min_size
        };

        let cur_size = if tl.plab_size == 0 {
            plab_min_size
        } else {
            tl.plab_size
        };
        let future_size = (cur_size * 2).min(self.plab_max_size);
        debug_assert_eq!(future_size % CARD_WORDS, 0);
        tl.plab_size = future_size;
        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_plab_size(future_size);

        if cur_size < size {
            // Too big for a PLAB of the current size; use a shared allocation.
            return None;
        }

        if tl.plab.words_remaining() >= plab_min_size {
            // Keep nibbling at this PLAB.
            return None;
        }

        self.retire_plab(tl);
        let Some(buffer) = self.allocate_new_plab(min_size, cur_size) else {
            if min_size == plab_min_size {
                tl.allow_plab_promotions = false;
            }
            return None;
        };
        tl.plab_retries_enabled = true;
        tl.plab.set_buf(buffer);
        self.configure_plab_for_promotion(tl, buffer.words());

        if is_promotion && !tl.allow_plab_promotions {
            return None;
        }
        tl.plab.allocate(size)
    }

    /// Charges a new PLAB against the promotion budget when it fits;
    /// otherwise the PLAB may only hold old-to-old evacuations.
    fn configure_plab_for_promotion(&self, tl: &mut GcThreadLocal, actual_size: usize) {
        tl.plab_promoted = 0;
        if self.old.try_expend_promoted(actual_size) {
            tl.allow_plab_promotions = true;
            tl.plab_actual_size = actual_size;
        } else {
            tl.allow_plab_promotions = false;
            tl.plab_actual_size = 0;
        }
    }

    /// Retires the thread's PLAB, refunding the unpromoted part of its budget.
    pub fn retire_plab(&self, tl: &mut GcThreadLocal) {
        let not_promoted = tl.plab_actual_size.saturating_sub(tl.plab_promoted);
        tl.plab_promoted = 0;
        tl.plab_actual_size = 0;
        if not_promoted > 0 {
            self.old.unexpend_promoted(not_promoted);
        }
        if let Some((buffer, top)) = tl.plab.take() {
            self.retire_plab_buffer(buffer, top);
        }
    }

    /// Retires a PLAB buffer whose allocation ended at `top`.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not outstanding, which means it was retired
    /// before or never came from [`allocate_new_plab`](Self::allocate_new_plab).
    pub fn retire_plab_buffer(&self, buffer: LabBuffer, top: Address) {
        let known = self.outstanding_plabs.lock().remove(&buffer);
        assert!(
            known,
            "PLAB [{}, {}) retired twice or never allocated",
            buffer.start, buffer.end
        );
        self.retire_lab_buffer(Affiliation::Old, buffer, top);
    }

    /// Hands the unused tail of a LAB back. When the LAB still ends at its
    /// region's top the tail is returned to the region; otherwise it becomes a
    /// filler so the region stays parsable.
    fn retire_lab_buffer(&self, affiliation: Affiliation, buffer: LabBuffer, top: Address) {
        let remaining = buffer.end.offset_from(top);
        if remaining == 0 {
            return;
        }
        let lock = self.lock();
        let region = self.region_containing(buffer.start);
        let old_top = buffer.end.offset_from(region.bottom());
        let new_top = top.offset_from(region.bottom());
        if new_top >= region.tams() && region.try_rollback(&lock, old_top, new_top) {
            self.generation(affiliation).decrease_used(remaining);
        } else {
            object::write_filler(self.words(), top.to_usize(), remaining);
        }
    }

    /// Number of PLABs handed out and not yet retired.
    #[must_use]
    pub fn outstanding_plabs(&self) -> usize {
        self.outstanding_plabs.lock().len()
    }

    fn allocate_from_gclab(&self, tl: &mut GcThreadLocal, size: usize) -> Option<Address> {
        if let Some(obj) = tl.gclab.allocate(size) {
            return Some(obj);
        }
        self.allocate_from_gclab_slow(tl, size)
    }

    fn allocate_from_gclab_slow(&self, tl: &mut GcThreadLocal, size: usize) -> Option<Address> {
        let new_size = (tl.gclab_size * 2)
            .min(self.plab_max_size)
            .max(self.plab_min_size);
        tl.gclab_size = new_size;
        if new_size < size {
            return None;
        }
        self.retire_gclab(tl);
        let min_size = size.max(self.plab_min_size);
        let buffer = {
            let mut lock = self.lock();
            self.allocate_lab(&mut lock, Affiliation::Young, min_size, new_size, 1)?
        };
        tl.gclab.set_buf(buffer);
        tl.gclab.allocate(size)
    }

    /// Retires the thread's young GCLAB.
    pub fn retire_gclab(&self, tl: &mut GcThreadLocal) {
        if let Some((buffer, top)) = tl.gclab.take() {
            self.retire_lab_buffer(Affiliation::Young, buffer, top);
        }
    }

    /// Retires both buffers at the end of a thread's GC phase.
    pub fn retire_thread_labs(&self, tl: &mut GcThreadLocal) {
        self.retire_plab(tl);
        self.retire_gclab(tl);
    }

    // ========================================================================
    // Evacuation
    // ========================================================================

    /// Marks the start of an evacuation phase.
    pub fn begin_evacuation(&self) {
        self.gc_state.set_evacuation_in_progress(true);
        self.gc_state.set_has_forwarded_objects(true);
    }

    /// Marks the end of an evacuation phase. Every thread must have retired
    /// its buffers.
    pub fn end_evacuation(&self) {
        debug_assert_eq!(
            self.outstanding_plabs(),
            0,
            "evacuation ended with PLABs still outstanding"
        );
        self.gc_state.set_evacuation_in_progress(false);
    }

    /// Copies `obj` out of its region, or returns the copy another thread made.
    ///
    /// Young objects old enough are promoted first; a failed promotion falls
    /// back to a copy within young. Old objects stay old.
    ///
    /// # Panics
    ///
    /// Panics for humongous or unaffiliated objects.
    pub fn evacuate_object(&self, tl: &mut GcThreadLocal, obj: Address) -> Address {
        if tl.oom_during_evac {
            return self.resolve_forwarded(obj);
        }

        let region = self.region_containing(obj);
        assert!(!region.is_humongous(), "never evacuate humongous objects");

        let mark = object::mark_word(self.words(), obj.to_usize());
        if let Some(copy) = mark.forwardee() {
            return copy;
        }

        match region.affiliation() {
            Affiliation::Young => {
                let region_age = region.age();
                if u16::from(region_age) + u16::from(mark.age())
                    >= u16::from(self.config.tenuring_threshold)
                {
                    if let Some(copy) = self.try_evacuate_object(
                        tl,
                        obj,
                        GenerationKind::Young,
                        GenerationKind::Old,
                        region_age,
                    ) {
                        return copy;
                    }
                }
                self.try_evacuate_object(tl, obj, GenerationKind::Young, GenerationKind::Young, region_age)
                    .unwrap_or_else(|| self.resolve_forwarded(obj))
            }
            Affiliation::Old => self
                .try_evacuate_object(tl, obj, GenerationKind::Old, GenerationKind::Old, 0)
                .unwrap_or_else(|| self.resolve_forwarded(obj)),
            Affiliation::Free => panic!("object {obj} is not in an affiliated region"),
        }
    }

    /// Copies `obj` from `from` into `to`.
    ///
    /// Returns `None` only for a failed promotion; the caller then evacuates
    /// within young. Any other allocation failure cancels the cycle and
    /// returns the object's current canonical location.
    pub fn try_evacuate_object(
        &self,
        tl: &mut GcThreadLocal,
        obj: Address,
        from: GenerationKind,
        to: GenerationKind,
        from_region_age: u8,
    ) -> Option<Address> {
        let words = self.words();
        let size = object::object_size(words, obj.to_usize());
        let is_promotion = from == GenerationKind::Young && to == GenerationKind::Old;
        let mut alloc_from_lab = true;

        let mut copy = match to {
            GenerationKind::Young => {
                let mut copy = self.allocate_from_gclab(tl, size);
                if copy.is_none() && size < tl.gclab_size {
                    tl.gclab_size = self.plab_min_size;
                    copy = self.allocate_from_gclab(tl, size);
                }
                copy
            }
            GenerationKind::Old => {
                let mut copy = self.allocate_from_plab(tl, size, is_promotion);
                if copy.is_none()
                    && size < tl.plab_size
                    && tl.plab_retries_enabled
                    && tl.plab.words_remaining() < self.plab_min_size
                {
                    tl.plab_size = self.plab_min_size;
                    copy = self.allocate_from_plab(tl, size, is_promotion);
                    if copy.is_none() {
                        tl.plab_retries_enabled = false;
                    }
                }
                copy
            }
        };

        // Small promotions are not worth a shared allocation; the object stays
        // young and is promoted by a later cycle.
        if copy.is_none() && (!is_promotion || size > self.plab_min_size) {
            copy = self.allocate_shared_gc(to, size, is_promotion);
            alloc_from_lab = false;
        }

        let Some(copy) = copy else {
            if to == GenerationKind::Old {
                if from == GenerationKind::Young {
                    self.old.handle_failed_promotion(size);
                    return None;
                }
                self.old.handle_failed_evacuation();
            }
            self.handle_oom_during_evacuation(tl);
            return Some(self.resolve_forwarded(obj));
        };

        object::copy_words(words, obj.to_usize(), copy.to_usize(), size);
        if to == GenerationKind::Young && self.is_aging_cycle() {
            object::increase_object_age(words, copy.to_usize(), from_region_age.saturating_add(1));
        }

        let result = object::try_update_forwardee(words, obj.to_usize(), copy);
        if result == copy {
            if is_promotion {
                self.promoted_words.fetch_add(size, Ordering::Relaxed);
            }
            return Some(copy);
        }

        // Lost the race. The stale copy must never be walked as a live object.
        if alloc_from_lab {
            let undone = match to {
                GenerationKind::Young => tl.gclab.undo_allocation(copy, size),
                GenerationKind::Old => {
                    if is_promotion {
                        tl.plab_promoted -= size;
                    }
                    tl.plab.undo_allocation(copy, size)
                }
            };
            debug_assert!(undone, "losing copy was not the last LAB allocation");
        } else {
            object::write_filler(words, copy.to_usize(), size);
        }
        Some(result)
    }

    fn allocate_shared_gc(&self, to: GenerationKind, size: usize, is_promotion: bool) -> Option<Address> {
        let mut lock = self.lock();
        if is_promotion && !self.old.try_expend_promoted(size) {
            return None;
        }
        let obj = self.allocate_under_lock(&mut lock, to.affiliation(), size);
        if obj.is_none() && is_promotion {
            self.old.unexpend_promoted(size);
        }
        obj
    }

    fn handle_oom_during_evacuation(&self, tl: &mut GcThreadLocal) {
        tl.oom_during_evac = true;
        self.gc_state.cancel_gc(GcCause::AllocationFailureEvac);
    }

    /// Rewrites every reference to a forwarded object, roots included, and
    /// clears the forwarded-objects state. Evacuation must have ended.
    ///
    /// # Panics
    ///
    /// Panics if evacuation is still in progress or a region is not parsable.
    pub fn update_references(&self) {
        assert!(
            !self.gc_state.is_evacuation_in_progress(),
            "update references during evacuation"
        );
        let words = self.words();
        for region in self.regions() {
            if !(region.is_regular() || region.is_humongous_start()) {
                continue;
            }
            let bottom = region.bottom().to_usize();
            let top = bottom + region.top();
            let mut at = bottom;
            while at < top {
                let class = object::class_word(words, at);
                let size = object::object_size(words, at);
                let forwarded = object::mark_word(words, at).is_forwarded();
                if !class.is_filler() && !forwarded {
                    for slot in &words[at + HEADER_WORDS..at + HEADER_WORDS + class.refs()] {
                        let raw = slot.load(Ordering::Acquire);
                        if raw != Address::NULL_SLOT {
                            let resolved = self.resolve_forwarded(Address::new(raw));
                            slot.store(resolved.to_usize(), Ordering::Release);
                        }
                    }
                }
                at += size;
            }
        }
        self.roots.update(|obj| self.resolve_forwarded(obj));
        self.weak_refs.update(|obj| self.resolve_forwarded(obj));
        self.gc_state.set_has_forwarded_objects(false);
    }

    // ========================================================================
    // Coalesce and fill outside a cycle
    // ========================================================================

    /// Makes every active old region parsable from its bottom, ignoring any
    /// earlier partial progress. Used by degenerated and full collections.
    ///
    /// With `concurrent` set the walk stops on cancellation and returns `false`.
    pub fn coalesce_and_fill_old_regions(&self, concurrent: bool) -> bool {
        let cancel = concurrent.then_some(&self.gc_state);
        for region in self.regions() {
            if region.is_old() && region.is_active() && !region.is_humongous() {
                region.begin_preemptible_coalesce_and_fill();
                if !region.oop_coalesce_and_fill(cancel) {
                    return false;
                }
            }
        }
        true
    }
}

fn to_isize(regions: usize) -> isize {
    isize::try_from(regions).unwrap_or(isize::MAX)
}
