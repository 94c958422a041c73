//! Heap verification hooks.
//!
//! Each check panics with a diagnostic on the first violation. They are
//! meant for pauses, where the heap does not change underneath them.

use crate::generational::GenerationalHeap;
use crate::object;
use crate::region::{Region, RegionState};

/// Runs consistency checks over one heap.
#[derive(Debug, Clone, Copy)]
pub struct Verifier<'a> {
    heap: &'a GenerationalHeap,
}

impl<'a> Verifier<'a> {
    #[must_use]
    pub const fn new(heap: &'a GenerationalHeap) -> Self {
        Self { heap }
    }

    /// No root may point to a forwarded object.
    ///
    /// # Panics
    ///
    /// Panics on the first forwarded root.
    pub fn verify_roots_no_forwarded(&self) {
        let words = self.heap.words();
        self.heap.roots().for_each(|obj| {
            assert!(
                !object::mark_word(words, obj.to_usize()).is_forwarded(),
                "root {obj} points to a forwarded object"
            );
        });
    }

    /// Old liveness is consistent after old marking.
    ///
    /// # Panics
    ///
    /// Panics if a region claims more live words than it holds, a marked
    /// object lies outside its region's allocated part, or a humongous
    /// continuation has no start.
    pub fn verify_after_old_mark(&self) {
        let mut expect_cont = false;
        for region in self.heap.regions() {
            if region.state() == RegionState::HumongousCont {
                assert!(
                    expect_cont,
                    "humongous continuation {} has no start region",
                    region.index()
                );
                continue;
            }
            expect_cont = region.is_humongous_start();
            if !region.is_old() || !region.is_active() {
                continue;
            }
            assert!(
                region.live_words() <= region.used_words() || region.is_humongous_start(),
                "region {} has {} live words but only {} used",
                region.index(),
                region.live_words(),
                region.used_words()
            );
            let last = region.next_marked(region.top(), region.capacity_words());
            assert_eq!(
                last,
                region.capacity_words(),
                "region {} has a mark above top",
                region.index()
            );
        }
    }

    /// The region can be walked object by object from bottom to top.
    ///
    /// If the region has been coalesced and filled, every object below TAMS
    /// must also be live or a filler.
    ///
    /// # Panics
    ///
    /// Panics if the walk does not end exactly at top, or on a dead object
    /// in a region that was filled.
    pub fn verify_region_parsable(&self, region: &Region) {
        if !region.is_regular() {
            return;
        }
        let words = region.words();
        let top = region.top();
        let tams = region.tams();
        let filled = region.is_old() && !region.needs_coalesce_and_fill();
        let mut offset = 0;
        while offset < top {
            let class = object::class_word(words, offset);
            if filled && offset < tams && !class.is_filler() {
                assert!(
                    region.is_marked(offset),
                    "dead object at offset {offset} in filled region {}",
                    region.index()
                );
            }
            offset += object::object_size(words, offset);
        }
        assert_eq!(offset, top, "walk of region {} overran top", region.index());
    }

    /// Every active old region is parsable.
    pub fn verify_old_regions_parsable(&self) {
        for region in self.heap.regions() {
            if region.is_old() && region.is_active() {
                self.verify_region_parsable(region);
            }
        }
    }
}
