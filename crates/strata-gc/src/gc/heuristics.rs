//! Old-generation candidate selection.
//!
//! After old marking the heuristics look at every active old region:
//!
//! - regions with no live data are trashed on the spot (immediate garbage);
//! - the remaining regular regions, fewest live words first, form the
//!   candidate list. The prefix with enough garbage is offered to mixed
//!   evacuations;
//! - every live regular candidate must also be coalesced and filled, since
//!   a mixed candidate may be abandoned before it is ever evacuated.
//!
//! Candidates taken by a mixed evacuation drop out of the coalesce-and-fill
//! list. A resumed coalesce-and-fill asks again and gets exactly the regions
//! that still need it.

use parking_lot::Mutex;

use crate::generational::GenerationalHeap;
use crate::heap::{HeapConfig, HeapLocker};

/// Policy deciding which old regions are collected and when old cycles run.
pub trait OldHeuristics: Send + Sync {
    /// Builds the candidate list from the liveness found by old marking.
    /// Runs at the final-mark pause with the heap lock held.
    fn prepare_for_old_collections(&self, heap: &GenerationalHeap, lock: &HeapLocker<'_>);

    /// Regions that still need coalesce-and-fill, humongous regions included.
    /// Agrees with what [`get_coalesce_and_fill_candidates`](Self::get_coalesce_and_fill_candidates)
    /// would return.
    fn old_coalesce_and_fill_candidates(&self, heap: &GenerationalHeap) -> usize;

    /// Writes the regions that still need coalesce-and-fill into `out`, in
    /// candidate order, and returns how many there are.
    fn get_coalesce_and_fill_candidates(&self, heap: &GenerationalHeap, out: &mut Vec<usize>) -> usize;

    /// Drops the remaining coalesce-and-fill work. Used when something else,
    /// a global collection say, makes old regions parsable.
    fn abandon_coalesce_and_fill_candidates(&self, heap: &GenerationalHeap);

    /// Makes the mixed candidates available to young cycles.
    fn start_old_evacuations(&self);

    /// Whether mixed evacuations may take candidates.
    fn evacuations_started(&self) -> bool;

    /// Takes the next mixed-evacuation candidate.
    fn take_old_collection_candidate(&self) -> Option<usize>;

    /// Mixed candidates not yet taken.
    fn unprocessed_old_collection_candidates(&self) -> usize;

    /// Live words in the mixed candidates not yet taken.
    fn unprocessed_candidates_live_words(&self) -> usize;

    /// Forgets every candidate.
    fn abandon_collection_candidates(&self);

    /// Whether an old cycle should start now.
    fn should_start_gc(&self, heap: &GenerationalHeap) -> bool;

    /// Old live words found by the last old mark.
    fn live_words_after_mark(&self) -> usize;
}

#[derive(Debug, Default)]
struct Candidates {
    /// `(region, live words)`, fewest live words first.
    regions: Vec<(usize, usize)>,
    humongous: Vec<usize>,
    next: usize,
    last_mixed: usize,
    evacuations_started: bool,
    live_after_mark: usize,
}

impl Candidates {
    /// Candidates not taken by a mixed evacuation that still need filling,
    /// then live humongous regions.
    fn unfilled<'a>(&'a self, heap: &'a GenerationalHeap) -> impl Iterator<Item = usize> + 'a {
        let regular = self.regions[self.next..]
            .iter()
            .map(|&(index, _)| index)
            .filter(|&index| {
                let region = heap.region(index);
                region.is_old() && region.needs_coalesce_and_fill()
            });
        let humongous = self
            .humongous
            .iter()
            .copied()
            .filter(|&index| heap.region(index).is_humongous_start());
        regular.chain(humongous)
    }
}

/// Default old heuristics: garbage-ranked candidates and a growth trigger.
#[derive(Debug)]
pub struct OldGenHeuristics {
    region_words: usize,
    garbage_threshold_words: usize,
    growth_percent: usize,
    state: Mutex<Candidates>,
}

impl OldGenHeuristics {
    #[must_use]
    pub fn new(config: &HeapConfig) -> Self {
        Self {
            region_words: config.region_words,
            garbage_threshold_words: config.region_words * config.old_garbage_threshold_percent / 100,
            growth_percent: config.old_growth_percent,
            state: Mutex::new(Candidates::default()),
        }
    }

    fn trigger(reason: &str, _live: usize, _used: usize, _growth: usize) {
        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_old_trigger(reason, _live, _used, _growth);
        #[cfg(not(feature = "tracing"))]
        let _ = reason;
    }
}

impl OldHeuristics for OldGenHeuristics {
    fn prepare_for_old_collections(&self, heap: &GenerationalHeap, lock: &HeapLocker<'_>) {
        let mut state = self.state.lock();
        state.regions.clear();
        state.humongous.clear();
        state.next = 0;
        state.evacuations_started = false;

        let mut immediate_regions = 0;
        let mut live_total = 0;
        for region in heap.regions() {
            if !region.is_old() || !region.is_active() {
                continue;
            }
            let live = region.live_words();
            if region.is_regular() {
                if live == 0 {
                    region.make_trash(lock);
                    immediate_regions += 1;
                } else {
                    state.regions.push((region.index(), live));
                }
            } else if region.is_humongous_start() {
                if live == 0 {
                    immediate_regions += heap.trash_humongous_region_at(lock, region.index());
                } else {
                    state.humongous.push(region.index());
                }
            }
            live_total += live;
        }

        state.regions.sort_by_key(|&(index, live)| (live, index));
        let max_live = self.region_words - self.garbage_threshold_words;
        state.last_mixed = state.regions.partition_point(|&(_, live)| live <= max_live);
        for &(index, _) in &state.regions {
            heap.region(index).begin_preemptible_coalesce_and_fill();
        }
        state.live_after_mark = live_total;

        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_old_candidates(
            state.last_mixed,
            state.regions.len() + state.humongous.len(),
            immediate_regions,
        );
        #[cfg(not(feature = "tracing"))]
        let _ = immediate_regions;
    }

    fn old_coalesce_and_fill_candidates(&self, heap: &GenerationalHeap) -> usize {
        let state = self.state.lock();
        state.unfilled(heap).count()
    }

    fn get_coalesce_and_fill_candidates(&self, heap: &GenerationalHeap, out: &mut Vec<usize>) -> usize {
        let state = self.state.lock();
        out.clear();
        out.extend(state.unfilled(heap));
        out.len()
    }

    fn abandon_coalesce_and_fill_candidates(&self, heap: &GenerationalHeap) {
        let state = self.state.lock();
        for &(index, _) in &state.regions[state.next..] {
            heap.region(index).end_preemptible_coalesce_and_fill();
        }
    }

    fn start_old_evacuations(&self) {
        self.state.lock().evacuations_started = true;
    }

    fn evacuations_started(&self) -> bool {
        self.state.lock().evacuations_started
    }

    fn take_old_collection_candidate(&self) -> Option<usize> {
        let mut state = self.state.lock();
        if !state.evacuations_started || state.next >= state.last_mixed {
            return None;
        }
        let (index, _) = state.regions[state.next];
        state.next += 1;
        Some(index)
    }

    fn unprocessed_old_collection_candidates(&self) -> usize {
        let state = self.state.lock();
        state.last_mixed.saturating_sub(state.next)
    }

    fn unprocessed_candidates_live_words(&self) -> usize {
        let state = self.state.lock();
        state
            .regions
            .get(state.next..state.last_mixed)
            .map_or(0, |rest| rest.iter().map(|&(_, live)| live).sum())
    }

    fn abandon_collection_candidates(&self) {
        let mut state = self.state.lock();
        state.regions.clear();
        state.humongous.clear();
        state.next = 0;
        state.last_mixed = 0;
        state.evacuations_started = false;
    }

    fn should_start_gc(&self, heap: &GenerationalHeap) -> bool {
        let old = heap.old();
        let used = old.used();
        let live = self.live_words_after_mark();

        if old.take_cannot_expand() {
            Self::trigger("Expansion failure", live, used, 0);
            return true;
        }
        if self.unprocessed_old_collection_candidates() > 0 {
            // Mixed evacuations are still reclaiming the last cycle's garbage.
            return false;
        }

        let baseline = live.max(self.region_words);
        if used <= baseline {
            return false;
        }
        let growth = (used - baseline) * 100 / baseline;
        if growth >= self.growth_percent {
            Self::trigger("Old has overgrown", live, used, growth);
            return true;
        }
        false
    }

    fn live_words_after_mark(&self) -> usize {
        self.state.lock().live_after_mark
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Affiliation;

    fn heap() -> GenerationalHeap {
        GenerationalHeap::new(HeapConfig {
            region_words: 256,
            num_regions: 16,
            max_tlab_words: 256,
            initial_old_percent: 50,
            ..HeapConfig::default()
        })
        .expect("reserve heap")
    }

    /// Fills a fresh old region and records `live` live words in it.
    fn old_region(heap: &GenerationalHeap, live: usize) -> usize {
        let obj = heap.allocate_object(Affiliation::Old, 256, 0).expect("old room");
        let region = heap.region_containing(obj);
        region.capture_top_at_mark_start();
        region.add_live_words(live);
        region.index()
    }

    #[test]
    fn test_candidates_ranked_and_dead_regions_trashed() {
        let heap = heap();
        let mostly_live = old_region(&heap, 250);
        let dead = old_region(&heap, 0);
        let sparse = old_region(&heap, 10);
        let half = old_region(&heap, 128);

        let heuristics = heap.old_heuristics();
        heuristics.prepare_for_old_collections(&heap, &heap.lock());

        assert!(heap.region(dead).is_trash());
        // Threshold is 25% garbage: at most 192 live words.
        assert_eq!(heuristics.unprocessed_old_collection_candidates(), 2);
        assert_eq!(heuristics.unprocessed_candidates_live_words(), 138);
        assert_eq!(heuristics.live_words_after_mark(), 388);

        let mut out = Vec::new();
        assert_eq!(heuristics.get_coalesce_and_fill_candidates(&heap, &mut out), 3);
        assert_eq!(out, vec![sparse, half, mostly_live]);
    }

    #[test]
    fn test_taken_candidates_leave_fill_list() {
        let heap = heap();
        let sparse = old_region(&heap, 10);
        let other = old_region(&heap, 20);
        let heuristics = heap.old_heuristics();
        heuristics.prepare_for_old_collections(&heap, &heap.lock());

        assert_eq!(heuristics.take_old_collection_candidate(), None);
        heuristics.start_old_evacuations();
        assert_eq!(heuristics.take_old_collection_candidate(), Some(sparse));

        let mut out = Vec::new();
        heuristics.get_coalesce_and_fill_candidates(&heap, &mut out);
        assert_eq!(out, vec![other]);
        assert_eq!(heuristics.unprocessed_old_collection_candidates(), 1);
    }

    #[test]
    fn test_filled_regions_are_not_offered_again() {
        let heap = heap();
        let a = old_region(&heap, 10);
        let b = old_region(&heap, 20);
        let heuristics = heap.old_heuristics();
        heuristics.prepare_for_old_collections(&heap, &heap.lock());
        heap.region(a).end_preemptible_coalesce_and_fill();

        let mut out = Vec::new();
        heuristics.get_coalesce_and_fill_candidates(&heap, &mut out);
        assert_eq!(out, vec![b]);
        assert_eq!(heuristics.old_coalesce_and_fill_candidates(&heap), 1);
    }

    #[test]
    fn test_abandoned_fill_clears_remaining_regions() {
        let heap = heap();
        let a = old_region(&heap, 10);
        let b = old_region(&heap, 20);
        let heuristics = heap.old_heuristics();
        heuristics.prepare_for_old_collections(&heap, &heap.lock());
        assert_eq!(heuristics.old_coalesce_and_fill_candidates(&heap), 2);

        heuristics.abandon_coalesce_and_fill_candidates(&heap);
        assert!(!heap.region(a).needs_coalesce_and_fill());
        assert!(!heap.region(b).needs_coalesce_and_fill());
        assert_eq!(heuristics.old_coalesce_and_fill_candidates(&heap), 0);
        let mut out = vec![usize::MAX];
        assert_eq!(heuristics.get_coalesce_and_fill_candidates(&heap, &mut out), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_abandoned_collection_candidates_are_forgotten() {
        let heap = heap();
        old_region(&heap, 10);
        old_region(&heap, 20);
        let heuristics = heap.old_heuristics();
        heuristics.prepare_for_old_collections(&heap, &heap.lock());
        heuristics.start_old_evacuations();
        assert_eq!(heuristics.unprocessed_old_collection_candidates(), 2);

        heuristics.abandon_collection_candidates();
        assert!(!heuristics.evacuations_started());
        assert_eq!(heuristics.unprocessed_old_collection_candidates(), 0);
        assert_eq!(heuristics.unprocessed_candidates_live_words(), 0);
        assert_eq!(heuristics.take_old_collection_candidate(), None);
        assert_eq!(heuristics.old_coalesce_and_fill_candidates(&heap), 0);
    }

    #[test]
    fn test_growth_trigger() {
        let heap = heap();
        let heuristics = heap.old_heuristics();
        assert!(!heuristics.should_start_gc(&heap));
        for _ in 0..2 {
            heap.allocate_object(Affiliation::Old, 256, 0).expect("old room");
        }
        // 512 used against a one-region baseline.
        assert!(heuristics.should_start_gc(&heap));
    }

    #[test]
    fn test_failed_expansion_triggers_once() {
        let heap = heap();
        heap.old().set_region_balance(-100);
        let _ = heap.balance_generations(&mut heap.lock());
        let heuristics = heap.old_heuristics();
        assert!(heuristics.should_start_gc(&heap));
        assert!(!heuristics.should_start_gc(&heap));
    }
}
