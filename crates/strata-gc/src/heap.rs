//! Heap configuration, the region registry and the free set.
//!
//! The whole heap is one [`Reservation`] carved into `num_regions` regions of
//! `region_words` words. The [`FreeSet`] tracks which regions are empty and
//! where each generation currently allocates; it lives behind the heap lock,
//! and a [`HeapLocker`] (the lock guard) is the proof that region accounting
//! may be mutated.

use std::collections::BTreeSet;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::AtomicUsize;

use parking_lot::MutexGuard;
use strata_sys::Reservation;

use crate::object::{Address, HEAP_WORD_SIZE};
use crate::region::{Affiliation, Region};

/// Words per card. PLAB sizes are multiples of this.
pub const CARD_WORDS: usize = 64;

pub const DEFAULT_REGION_WORDS: usize = 4096;
pub const DEFAULT_NUM_REGIONS: usize = 64;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_PLAB_MIN_WORDS: usize = 256;
pub const DEFAULT_MAX_TLAB_WORDS: usize = 1024;
pub const DEFAULT_TENURING_THRESHOLD: u8 = 7;

/// Heap and collector tuning.
///
/// Percentages are whole numbers in `0..=100`; waste factors are percentages
/// above 100 (`140` means 1.4x).
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Region size in words. A power of two and a multiple of [`CARD_WORDS`].
    pub region_words: usize,
    /// Number of regions in the heap.
    pub num_regions: usize,
    /// Worker threads for marking and coalesce-and-fill.
    pub workers: usize,
    /// Smallest PLAB, in words, before card alignment.
    pub plab_min_words: usize,
    /// Largest thread-local buffer, in words.
    pub max_tlab_words: usize,
    /// Caps the largest PLAB at this multiple of the smallest. Zero means
    /// only `max_tlab_words` applies.
    pub max_evac_lab_ratio: usize,
    /// Objects at least this old are promoted when evacuated.
    pub tenuring_threshold: u8,
    /// Share of young capacity held back for young evacuation.
    pub evac_reserve_percent: usize,
    /// Share of total evacuation that may target old.
    pub old_evac_ratio_percent: usize,
    /// Expected fragmentation when evacuating old candidates.
    pub old_evac_waste_percent: usize,
    /// Expected fragmentation when promoting.
    pub promo_evac_waste_percent: usize,
    /// Lower bound of young capacity, as a share of the heap.
    pub young_min_percent: usize,
    /// Upper bound of young capacity, as a share of the heap.
    pub young_max_percent: usize,
    /// Share of the heap given to old at startup.
    pub initial_old_percent: usize,
    /// Old regions with at least this much garbage become mixed candidates.
    pub old_garbage_threshold_percent: usize,
    /// Old usage growth over the last marked live size that starts an old cycle.
    pub old_growth_percent: usize,
    /// Run the heap verifier at collector pauses.
    pub verify: bool,
    /// Verify the old generation after old marking.
    pub verify_after_old_mark: bool,
    /// Process weak references during old cycles.
    pub weak_roots: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            region_words: DEFAULT_REGION_WORDS,
            num_regions: DEFAULT_NUM_REGIONS,
            workers: DEFAULT_WORKERS,
            plab_min_words: DEFAULT_PLAB_MIN_WORDS,
            max_tlab_words: DEFAULT_MAX_TLAB_WORDS,
            max_evac_lab_ratio: 0,
            tenuring_threshold: DEFAULT_TENURING_THRESHOLD,
            evac_reserve_percent: 5,
            old_evac_ratio_percent: 75,
            old_evac_waste_percent: 140,
            promo_evac_waste_percent: 120,
            young_min_percent: 20,
            young_max_percent: 100,
            initial_old_percent: 25,
            old_garbage_threshold_percent: 25,
            old_growth_percent: 12,
            verify: false,
            verify_after_old_mark: false,
            weak_roots: true,
        }
    }
}

impl HeapConfig {
    /// Panics on settings the heap cannot run with.
    ///
    /// # Panics
    ///
    /// On a zero-sized heap, misaligned region size, out-of-range percentage,
    /// or young bounds that do not admit the initial split.
    pub fn validate(&self) {
        assert!(self.num_regions > 0, "heap needs at least one region");
        assert!(
            self.region_words.is_power_of_two() && self.region_words >= CARD_WORDS,
            "region size {} must be a power of two of at least {CARD_WORDS} words",
            self.region_words
        );
        assert!(self.workers > 0, "need at least one worker");
        assert!(self.plab_min_words > 0, "PLAB minimum must be positive");
        assert!(
            self.max_tlab_words >= CARD_WORDS && self.max_tlab_words <= self.region_words,
            "max TLAB size {} must lie in [{CARD_WORDS}, {}]",
            self.max_tlab_words,
            self.region_words
        );
        for (name, value) in [
            ("evac_reserve_percent", self.evac_reserve_percent),
            ("old_evac_ratio_percent", self.old_evac_ratio_percent),
            ("young_min_percent", self.young_min_percent),
            ("young_max_percent", self.young_max_percent),
            ("initial_old_percent", self.initial_old_percent),
            ("old_garbage_threshold_percent", self.old_garbage_threshold_percent),
        ] {
            assert!(value <= 100, "{name} = {value} is not a percentage");
        }
        assert!(
            self.old_evac_waste_percent >= 100 && self.promo_evac_waste_percent >= 100,
            "waste factors below 100% are meaningless"
        );
        assert!(
            self.young_min_percent <= self.young_max_percent,
            "young_min_percent exceeds young_max_percent"
        );
        let young = self.num_regions - self.initial_old_regions();
        assert!(
            (self.min_young_regions()..=self.max_young_regions()).contains(&young),
            "initial young capacity of {young} regions is outside [{}, {}]",
            self.min_young_regions(),
            self.max_young_regions()
        );
    }

    #[must_use]
    pub const fn heap_words(&self) -> usize {
        self.region_words * self.num_regions
    }

    #[must_use]
    pub const fn min_young_regions(&self) -> usize {
        self.num_regions * self.young_min_percent / 100
    }

    #[must_use]
    pub const fn max_young_regions(&self) -> usize {
        self.num_regions * self.young_max_percent / 100
    }

    #[must_use]
    pub const fn initial_old_regions(&self) -> usize {
        self.num_regions * self.initial_old_percent / 100
    }

    /// Objects larger than this are allocated as humongous.
    #[must_use]
    pub const fn humongous_threshold_words(&self) -> usize {
        self.region_words
    }
}

/// Every region of the heap, over one contiguous reservation.
pub struct RegionRegistry {
    regions: Box<[Region]>,
    region_words: usize,
    // Must drop after `regions`.
    reservation: Reservation,
}

impl RegionRegistry {
    /// Reserves the heap and lays out its regions.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the heap cannot be reserved.
    pub fn new(config: &HeapConfig) -> io::Result<Self> {
        let reservation = Reservation::reserve(config.heap_words() * HEAP_WORD_SIZE)?;
        let base = reservation.start().cast::<AtomicUsize>();
        let regions = (0..config.num_regions)
            .map(|i| {
                // SAFETY: the reservation is zeroed, word aligned and holds
                // `num_regions * region_words` words; it outlives the regions.
                unsafe { Region::new(i, base.add(i * config.region_words), config.region_words) }
            })
            .collect();
        Ok(Self {
            regions,
            region_words: config.region_words,
            reservation,
        })
    }

    /// All heap words, indexed by [`Address`].
    #[must_use]
    pub fn words(&self) -> &[AtomicUsize] {
        // SAFETY: the reservation holds exactly this many words and lives as
        // long as `self`.
        unsafe {
            std::slice::from_raw_parts(
                self.reservation.start().cast::<AtomicUsize>(),
                self.regions.len() * self.region_words,
            )
        }
    }

    #[must_use]
    pub fn region(&self, index: usize) -> &Region {
        &self.regions[index]
    }

    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    #[must_use]
    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    #[must_use]
    pub const fn region_words(&self) -> usize {
        self.region_words
    }

    /// Region holding `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is outside the heap.
    #[must_use]
    pub fn region_containing(&self, addr: Address) -> &Region {
        &self.regions[addr.to_usize() / self.region_words]
    }

    /// Whether `addr` points into the heap.
    #[must_use]
    pub fn is_in(&self, addr: Address) -> bool {
        addr.to_usize() < self.regions.len() * self.region_words
    }

    /// Returns the memory of a recycled region to the OS. It reads as zero
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the pages cannot be discarded.
    pub fn uncommit_region(&self, index: usize) -> io::Result<()> {
        let bytes = self.region_words * HEAP_WORD_SIZE;
        self.reservation.discard(index * bytes, bytes)
    }
}

/// Empty regions and per-generation allocation regions.
#[derive(Debug)]
pub struct FreeSet {
    empty: BTreeSet<usize>,
    young_alloc: Option<usize>,
    old_alloc: Option<usize>,
}

impl FreeSet {
    pub(crate) fn new(num_regions: usize) -> Self {
        Self {
            empty: (0..num_regions).collect(),
            young_alloc: None,
            old_alloc: None,
        }
    }

    /// Number of empty, unaffiliated regions.
    #[must_use]
    pub fn empty_regions(&self) -> usize {
        self.empty.len()
    }

    /// Takes an empty region. Young allocates from the low end of the heap and
    /// old from the high end, keeping old regions together.
    pub(crate) fn take_empty(&mut self, affiliation: Affiliation) -> Option<usize> {
        match affiliation {
            Affiliation::Old => self.empty.pop_last(),
            _ => self.empty.pop_first(),
        }
    }

    /// Takes the lowest run of `count` contiguous empty regions.
    pub(crate) fn take_contiguous(&mut self, count: usize) -> Option<usize> {
        let mut run_start = None;
        let mut run_len = 0;
        let mut prev = None;
        for &idx in &self.empty {
            if prev.is_some_and(|p: usize| p + 1 == idx) {
                run_len += 1;
            } else {
                run_start = Some(idx);
                run_len = 1;
            }
            prev = Some(idx);
            if run_len == count {
                break;
            }
        }
        let start = run_start.filter(|_| run_len == count)?;
        for idx in start..start + count {
            self.empty.remove(&idx);
        }
        Some(start)
    }

    pub(crate) fn release(&mut self, index: usize) {
        self.forget_alloc_region(index);
        let fresh = self.empty.insert(index);
        debug_assert!(fresh, "region {index} released twice");
    }

    /// Region the generation currently bump-allocates in.
    #[must_use]
    pub const fn alloc_region(&self, affiliation: Affiliation) -> Option<usize> {
        match affiliation {
            Affiliation::Young => self.young_alloc,
            Affiliation::Old => self.old_alloc,
            Affiliation::Free => None,
        }
    }

    pub(crate) fn set_alloc_region(&mut self, affiliation: Affiliation, index: Option<usize>) {
        match affiliation {
            Affiliation::Young => self.young_alloc = index,
            Affiliation::Old => self.old_alloc = index,
            Affiliation::Free => {}
        }
    }

    fn forget_alloc_region(&mut self, index: usize) {
        if self.young_alloc == Some(index) {
            self.young_alloc = None;
        }
        if self.old_alloc == Some(index) {
            self.old_alloc = None;
        }
    }
}

/// Guard of the heap lock.
pub struct HeapLocker<'a> {
    free_set: MutexGuard<'a, FreeSet>,
}

impl<'a> HeapLocker<'a> {
    pub(crate) fn new(free_set: MutexGuard<'a, FreeSet>) -> Self {
        Self { free_set }
    }
}

impl Deref for HeapLocker<'_> {
    type Target = FreeSet;

    fn deref(&self) -> &FreeSet {
        &self.free_set
    }
}

impl DerefMut for HeapLocker<'_> {
    fn deref_mut(&mut self) -> &mut FreeSet {
        &mut self.free_set
    }
}
