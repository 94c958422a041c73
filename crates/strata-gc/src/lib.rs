//! The old-generation cycle of a concurrent, region-based generational
//! collector.
//!
//! `strata-gc` manages a heap carved into equal-sized regions, each affiliated
//! with the young or the old generation. Young collections run often and may
//! interrupt the old cycle at well-defined points. This crate implements that
//! old cycle and the machinery around it:
//!
//! - **Old-generation driver** ([`OldGc`]): marks old, clears dead weak
//!   referents, reclaims fully dead regions, and makes the remaining old
//!   regions parsable by coalescing runs of dead objects into fillers.
//! - **Preemptible coalesce-and-fill** ([`gc::CoalesceAndFillTask`]): a
//!   round-robin parallel task that stops cleanly when a young collection
//!   needs the workers, and resumes with the regions that are left.
//! - **Generation balancing** ([`GenerationalHeap::balance_generations`]):
//!   moves empty regions between generations to fund the next cycle.
//! - **PLAB promotion** ([`GenerationalHeap::evacuate_object`]): per-thread
//!   promotion buffers, card-aligned and bounded by the promotion reserve.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use strata_gc::{Affiliation, GcCause, GenerationalHeap, HeapConfig, OldGc};
//!
//! let heap = Arc::new(
//!     GenerationalHeap::new(HeapConfig {
//!         region_words: 256,
//!         num_regions: 8,
//!         max_tlab_words: 256,
//!         ..HeapConfig::default()
//!     })
//!     .expect("reserve heap"),
//! );
//! let obj = heap.allocate_object(Affiliation::Old, 8, 0).expect("old room");
//! heap.roots().add(obj);
//!
//! let driver = OldGc::new(Arc::clone(&heap));
//! assert!(driver.collect(GcCause::Explicit));
//! ```
//!
//! # Preemption
//!
//! A [`gc::Regulator`] interrupts the old cycle only while its preemption
//! guard is set. An interrupted coalesce-and-fill leaves
//! `concurrent_prep_for_mixed_evacuation_in_progress` set; the next
//! [`OldGc::collect`] skips marking and continues filling.

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod gc;
pub mod generation;
pub mod generational;
pub mod heap;
pub mod metrics;
pub mod object;
pub mod plab;
pub mod region;

/// Structured tracing for old-generation cycles.
pub mod tracing;

pub use gc::{
    CollectionStrategy, DegenPoint, GcCause, GcState, OldGc, OldPhase, Regulator, RegulatorThread,
};
pub use generation::{Generation, GenerationKind};
pub use generational::{GenerationalHeap, TransferResult};
pub use heap::{HeapConfig, HeapLocker};
pub use metrics::{CycleOutcome, OldGcMetrics, PhaseTimer};
pub use object::Address;
pub use plab::GcThreadLocal;
pub use region::{Affiliation, Region, RegionState};

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util {
    use crate::generational::GenerationalHeap;
    use crate::object::Address;
    use crate::region::Affiliation;

    /// Makes the next cancellable fill of region `index` report preemption
    /// before touching the region.
    pub fn inject_preemption(heap: &GenerationalHeap, index: usize) {
        heap.region(index).inject_preemption();
    }

    /// Objects of a region laid out by [`old_region_with_gaps`].
    #[derive(Debug, Clone, Copy)]
    pub struct GappedRegion {
        pub index: usize,
        /// Four words at offset 0.
        pub first: Address,
        /// Fills the region from offset 18 up to the last four words.
        pub middle: Address,
        /// Last four words.
        pub last: Address,
    }

    /// Fills one fresh old region with `[live:4][dead:6][dead:8][live][live:4]`
    /// and roots the three live objects. After marking, coalesce-and-fill
    /// writes a single 14-word filler at offset 4.
    ///
    /// # Panics
    ///
    /// Panics if old has no room for another region.
    pub fn old_region_with_gaps(heap: &GenerationalHeap) -> GappedRegion {
        let first = allocate(heap, 4);
        assert_eq!(
            first.offset_from(heap.region_containing(first).bottom()),
            0,
            "old_region_with_gaps needs a fresh region"
        );
        allocate(heap, 6);
        allocate(heap, 8);
        let rest = heap.region_containing(first).free_words() - 4;
        let middle = allocate(heap, rest);
        let last = allocate(heap, 4);
        for obj in [first, middle, last] {
            heap.roots().add(obj);
        }
        GappedRegion {
            index: heap.region_containing(first).index(),
            first,
            middle,
            last,
        }
    }

    /// Whether region `index` holds the filler written over its dead gap.
    pub fn gap_is_filled(heap: &GenerationalHeap, index: usize) -> bool {
        let at = heap.region(index).bottom().to_usize() + 4;
        let class = crate::object::class_word(heap.words(), at);
        class.is_filler() && class.size() == 14
    }

    fn allocate(heap: &GenerationalHeap, size: usize) -> Address {
        heap.allocate_object(Affiliation::Old, size, 0)
            .unwrap_or_else(|| panic!("no old room for {size} words"))
    }
}
