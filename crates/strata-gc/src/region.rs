//! Fixed-size heap regions.
//!
//! A region is a contiguous run of heap words with an allocation `top`, a
//! generation [`Affiliation`] and a [`RegionState`]. Marking records live
//! objects in a per-region bitmap, one bit per word, valid below the region's
//! top-at-mark-start (TAMS). Everything allocated at or above TAMS is
//! implicitly live.
//!
//! State and affiliation only change through methods that take a
//! [`HeapLocker`], so holding the heap lock is a compile-time requirement for
//! region accounting.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::gc::state::GcState;
use crate::heap::HeapLocker;
use crate::object::{self, Address, MIN_OBJECT_WORDS};

/// Occupancy state of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegionState {
    /// Unused and unaffiliated.
    Empty = 0,
    /// Holds ordinary objects.
    Regular = 1,
    /// First region of a humongous object.
    HumongousStart = 2,
    /// Continuation of a humongous object.
    HumongousCont = 3,
    /// Reclaimed, waiting to be recycled.
    Trash = 4,
}

impl RegionState {
    #[must_use]
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Regular,
            2 => Self::HumongousStart,
            3 => Self::HumongousCont,
            4 => Self::Trash,
            _ => Self::Empty,
        }
    }
}

/// Generation a region currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Affiliation {
    /// Not owned by any generation.
    Free = 0,
    /// Young generation.
    Young = 1,
    /// Old generation.
    Old = 2,
}

impl Affiliation {
    #[must_use]
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Young,
            2 => Self::Old,
            _ => Self::Free,
        }
    }

    /// Short label used in logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Young => "young",
            Self::Old => "old",
        }
    }
}

/// A heap region.
pub struct Region {
    index: usize,
    bottom: Address,
    words: *const AtomicUsize,
    len: usize,
    state: AtomicU8,
    affiliation: AtomicU8,
    /// Allocation top, as a word offset from `bottom`.
    top: AtomicUsize,
    /// Top at mark start, as a word offset from `bottom`.
    tams: AtomicUsize,
    marks: Box<[AtomicU64]>,
    live_words: AtomicUsize,
    age: AtomicU8,
    /// Where a suspended coalesce-and-fill resumes.
    fill_boundary: AtomicUsize,
    needs_fill: AtomicBool,
    #[cfg(any(test, feature = "test-util"))]
    inject_preemption: AtomicBool,
}

// SAFETY: `words` points into the heap reservation, which outlives every
// region and is only accessed through atomics.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("index", &self.index)
            .field("state", &self.state())
            .field("affiliation", &self.affiliation())
            .field("top", &self.top())
            .field("tams", &self.tams())
            .field("live_words", &self.live_words())
            .finish_non_exhaustive()
    }
}

impl Region {
    /// Creates region `index` over `len` words starting at `words`.
    ///
    /// # Safety
    ///
    /// `words` must point to `len` initialised words that stay valid for the
    /// lifetime of the region.
    pub(crate) unsafe fn new(index: usize, words: *const AtomicUsize, len: usize) -> Self {
        let bitmap_words = len.div_ceil(64);
        Self {
            index,
            bottom: Address::new(index * len),
            words,
            len,
            state: AtomicU8::new(RegionState::Empty as u8),
            affiliation: AtomicU8::new(Affiliation::Free as u8),
            top: AtomicUsize::new(0),
            tams: AtomicUsize::new(0),
            marks: (0..bitmap_words).map(|_| AtomicU64::new(0)).collect(),
            live_words: AtomicUsize::new(0),
            age: AtomicU8::new(0),
            fill_boundary: AtomicUsize::new(0),
            needs_fill: AtomicBool::new(false),
            #[cfg(any(test, feature = "test-util"))]
            inject_preemption: AtomicBool::new(false),
        }
    }

    /// Index of this region in the registry.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// First word of the region.
    #[must_use]
    pub const fn bottom(&self) -> Address {
        self.bottom
    }

    /// One past the last word of the region.
    #[must_use]
    pub const fn end(&self) -> Address {
        self.bottom.offset(self.len)
    }

    /// Region size in words.
    #[must_use]
    pub const fn capacity_words(&self) -> usize {
        self.len
    }

    /// Whether `addr` lies inside this region.
    #[must_use]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.bottom && addr < self.end()
    }

    /// The region's words, indexed by offset from `bottom`.
    #[must_use]
    pub fn words(&self) -> &[AtomicUsize] {
        // SAFETY: see `Region::new`.
        unsafe { std::slice::from_raw_parts(self.words, self.len) }
    }

    #[must_use]
    pub fn state(&self) -> RegionState {
        RegionState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn affiliation(&self) -> Affiliation {
        Affiliation::from_u8(self.affiliation.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_old(&self) -> bool {
        self.affiliation() == Affiliation::Old
    }

    #[must_use]
    pub fn is_young(&self) -> bool {
        self.affiliation() == Affiliation::Young
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.state() == RegionState::Regular
    }

    #[must_use]
    pub fn is_humongous(&self) -> bool {
        matches!(
            self.state(),
            RegionState::HumongousStart | RegionState::HumongousCont
        )
    }

    #[must_use]
    pub fn is_humongous_start(&self) -> bool {
        self.state() == RegionState::HumongousStart
    }

    #[must_use]
    pub fn is_trash(&self) -> bool {
        self.state() == RegionState::Trash
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state() == RegionState::Empty
    }

    /// Affiliated and holding objects.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(self.state(), RegionState::Empty | RegionState::Trash)
    }

    // ------------------------------------------------------------------------
    // State transitions, all under the heap lock
    // ------------------------------------------------------------------------

    fn set_state(&self, state: RegionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn make_regular(&self, _lock: &HeapLocker<'_>, affiliation: Affiliation) {
        debug_assert!(self.is_empty(), "region {} is not empty", self.index);
        debug_assert_ne!(affiliation, Affiliation::Free);
        self.affiliation.store(affiliation as u8, Ordering::Release);
        self.set_state(RegionState::Regular);
    }

    pub(crate) fn make_humongous_start(&self, _lock: &HeapLocker<'_>, affiliation: Affiliation) {
        debug_assert!(self.is_empty(), "region {} is not empty", self.index);
        self.affiliation.store(affiliation as u8, Ordering::Release);
        self.set_state(RegionState::HumongousStart);
    }

    pub(crate) fn make_humongous_cont(&self, _lock: &HeapLocker<'_>, affiliation: Affiliation) {
        debug_assert!(self.is_empty(), "region {} is not empty", self.index);
        self.affiliation.store(affiliation as u8, Ordering::Release);
        self.set_state(RegionState::HumongousCont);
    }

    /// Declares the whole region garbage. Accounting is settled at recycle.
    pub(crate) fn make_trash(&self, _lock: &HeapLocker<'_>) {
        debug_assert!(self.is_active(), "region {} is not active", self.index);
        self.set_state(RegionState::Trash);
    }

    /// Returns a trashed region to the empty, unaffiliated state.
    pub(crate) fn recycle(&self, _lock: &HeapLocker<'_>) {
        debug_assert!(self.is_trash(), "region {} is not trash", self.index);
        self.top.store(0, Ordering::Release);
        self.tams.store(0, Ordering::Release);
        self.clear_marks();
        self.live_words.store(0, Ordering::Relaxed);
        self.age.store(0, Ordering::Relaxed);
        self.end_preemptible_coalesce_and_fill();
        self.affiliation.store(Affiliation::Free as u8, Ordering::Release);
        self.set_state(RegionState::Empty);
    }

    // ------------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------------

    /// Allocation top as an offset from `bottom`.
    #[must_use]
    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn used_words(&self) -> usize {
        self.top()
    }

    #[must_use]
    pub fn free_words(&self) -> usize {
        self.len - self.top()
    }

    /// Bumps `top` by `size` words.
    pub(crate) fn allocate(&self, _lock: &HeapLocker<'_>, size: usize) -> Option<Address> {
        let top = self.top();
        if self.len - top < size {
            return None;
        }
        self.top.store(top + size, Ordering::Release);
        Some(self.bottom.offset(top))
    }

    /// Moves `top` back to `new_top` when nothing was allocated past `old_top`.
    pub(crate) fn try_rollback(&self, _lock: &HeapLocker<'_>, old_top: usize, new_top: usize) -> bool {
        if self.top() == old_top {
            self.top.store(new_top, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub(crate) fn set_top(&self, _lock: &HeapLocker<'_>, top: usize) {
        self.top.store(top, Ordering::Release);
    }

    // ------------------------------------------------------------------------
    // Marking
    // ------------------------------------------------------------------------

    /// Top at mark start, as an offset from `bottom`.
    #[must_use]
    pub fn tams(&self) -> usize {
        self.tams.load(Ordering::Acquire)
    }

    /// Prepares the region for a new marking cycle.
    pub(crate) fn capture_top_at_mark_start(&self) {
        self.clear_marks();
        self.live_words.store(0, Ordering::Relaxed);
        self.tams.store(self.top(), Ordering::Release);
    }

    pub(crate) fn clear_marks(&self) {
        for word in &*self.marks {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Sets the mark bit at `offset`. Returns `true` if it was clear.
    pub(crate) fn mark(&self, offset: usize) -> bool {
        let bit = 1u64 << (offset % 64);
        self.marks[offset / 64].fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    /// Whether the object at `offset` is marked.
    #[must_use]
    pub fn is_marked(&self, offset: usize) -> bool {
        let bit = 1u64 << (offset % 64);
        self.marks[offset / 64].load(Ordering::Acquire) & bit != 0
    }

    /// Marked, or allocated after mark start.
    #[must_use]
    pub fn is_marked_or_above_tams(&self, offset: usize) -> bool {
        offset >= self.tams() || self.is_marked(offset)
    }

    /// First marked offset in `[from, limit)`, or `limit` if there is none.
    #[must_use]
    pub fn next_marked(&self, from: usize, limit: usize) -> usize {
        if from >= limit {
            return limit;
        }
        let mut word = from / 64;
        let mut bits = self.marks[word].load(Ordering::Acquire) & (!0u64 << (from % 64));
        loop {
            if bits != 0 {
                let found = word * 64 + bits.trailing_zeros() as usize;
                return found.min(limit);
            }
            word += 1;
            if word * 64 >= limit {
                return limit;
            }
            bits = self.marks[word].load(Ordering::Acquire);
        }
    }

    pub(crate) fn add_live_words(&self, words: usize) {
        self.live_words.fetch_add(words, Ordering::Relaxed);
    }

    #[must_use]
    pub fn live_words(&self) -> usize {
        self.live_words.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn has_live(&self) -> bool {
        self.live_words() > 0
    }

    #[must_use]
    pub fn garbage_words(&self) -> usize {
        self.used_words().saturating_sub(self.live_words())
    }

    // ------------------------------------------------------------------------
    // Age
    // ------------------------------------------------------------------------

    /// Young collections this region survived.
    #[must_use]
    pub fn age(&self) -> u8 {
        self.age.load(Ordering::Relaxed)
    }

    pub fn increment_age(&self) {
        let _ = self
            .age
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |a| {
                Some(a.saturating_add(1).min(object::MAX_AGE))
            });
    }

    pub fn reset_age(&self) {
        self.age.store(0, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------------
    // Coalesce and fill
    // ------------------------------------------------------------------------

    /// Makes the region eligible for coalesce-and-fill from its bottom.
    pub(crate) fn begin_preemptible_coalesce_and_fill(&self) {
        self.fill_boundary.store(0, Ordering::Relaxed);
        self.needs_fill.store(true, Ordering::Release);
    }

    pub(crate) fn end_preemptible_coalesce_and_fill(&self) {
        self.needs_fill.store(false, Ordering::Release);
        self.fill_boundary.store(0, Ordering::Relaxed);
    }

    /// Whether garbage in this region still has to be made walkable.
    #[must_use]
    pub fn needs_coalesce_and_fill(&self) -> bool {
        self.needs_fill.load(Ordering::Acquire)
    }

    /// Offset where a suspended fill resumes.
    #[must_use]
    pub fn coalesce_and_fill_boundary(&self) -> usize {
        self.fill_boundary.load(Ordering::Relaxed)
    }

    /// Arms a one-shot preemption for the next cancellable fill.
    #[cfg(any(test, feature = "test-util"))]
    pub(crate) fn inject_preemption(&self) {
        self.inject_preemption.store(true, Ordering::Release);
    }

    #[cfg(any(test, feature = "test-util"))]
    fn take_injected_preemption(&self) -> bool {
        self.inject_preemption.swap(false, Ordering::AcqRel)
    }

    /// Overwrites every run of unmarked objects below TAMS with one filler.
    ///
    /// With `cancel` set, the walk checks for GC cancellation after each step
    /// and, when cancelled, records where it stopped and returns `false`. The
    /// next call continues from that point. Returns `true` once the whole
    /// region is parsable without the mark bitmap.
    pub fn oop_coalesce_and_fill(&self, cancel: Option<&GcState>) -> bool {
        if !self.needs_coalesce_and_fill() {
            return true;
        }

        #[cfg(any(test, feature = "test-util"))]
        if cancel.is_some() && self.take_injected_preemption() {
            return false;
        }

        let words = self.words();
        let tams = self.tams();
        let mut offset = self.coalesce_and_fill_boundary();

        while offset < tams {
            if self.is_marked(offset) {
                offset += object::object_size(words, offset);
            } else {
                let next = self.next_marked(offset, tams);
                let fill = next - offset;
                debug_assert!(
                    fill >= MIN_OBJECT_WORDS,
                    "dead run of {fill} words at {offset} in region {}",
                    self.index
                );
                object::write_filler(words, offset, fill);
                offset = next;
            }
            if cancel.is_some_and(GcState::cancelled_gc) {
                self.fill_boundary.store(offset, Ordering::Relaxed);
                return false;
            }
        }

        self.end_preemptible_coalesce_and_fill();
        true
    }
}
