//! Integration tests for weak-root processing during the old cycle.

#![cfg(feature = "test-util")]

use std::sync::Arc;

use strata_gc::test_util::old_region_with_gaps;
use strata_gc::{Affiliation, GcCause, GenerationalHeap, HeapConfig, OldGc};

fn heap(weak_roots: bool) -> Arc<GenerationalHeap> {
    Arc::new(
        GenerationalHeap::new(HeapConfig {
            region_words: 256,
            num_regions: 16,
            max_tlab_words: 256,
            initial_old_percent: 50,
            weak_roots,
            ..HeapConfig::default()
        })
        .expect("reserve heap"),
    )
}

#[test]
fn test_dead_referents_cleared_before_fill() {
    let heap = heap(true);
    let region = old_region_with_gaps(&heap);
    let dead_in_gap = region.first.offset(4);
    let weak = heap.weak_refs();
    let to_live = weak.register(region.middle);
    let to_gap = weak.register(dead_in_gap);

    assert!(OldGc::new(Arc::clone(&heap)).collect(GcCause::Explicit));
    assert_eq!(weak.get(to_live), Some(region.middle));
    // The referent's memory now belongs to a filler.
    assert_eq!(weak.get(to_gap), None);
}

#[test]
fn test_referent_in_reclaimed_region_is_cleared() {
    let heap = heap(true);
    old_region_with_gaps(&heap);
    let garbage = heap.allocate_object(Affiliation::Old, 64, 0).expect("old room");
    let garbage_region = heap.region_containing(garbage).index();
    let slot = heap.weak_refs().register(garbage);

    assert!(OldGc::new(Arc::clone(&heap)).collect(GcCause::Explicit));
    assert_eq!(heap.weak_refs().get(slot), None);
    assert!(heap.region(garbage_region).is_empty());
}

#[test]
fn test_young_referents_are_left_alone() {
    let heap = heap(true);
    old_region_with_gaps(&heap);
    let young = heap.allocate_object(Affiliation::Young, 8, 0).expect("young room");
    let slot = heap.weak_refs().register(young);

    assert!(OldGc::new(Arc::clone(&heap)).collect(GcCause::Explicit));
    assert_eq!(heap.weak_refs().get(slot), Some(young));
}

#[test]
fn test_referent_reachable_through_heap_survives() {
    let heap = heap(true);
    let holder = heap.allocate_object(Affiliation::Old, 4, 1).expect("old room");
    let held = heap.allocate_object(Affiliation::Old, 6, 0).expect("old room");
    heap.write_ref(holder, 0, Some(held));
    heap.roots().add(holder);
    let slot = heap.weak_refs().register(held);

    assert!(OldGc::new(Arc::clone(&heap)).collect(GcCause::Explicit));
    assert_eq!(heap.weak_refs().get(slot), Some(held));
}

#[test]
fn test_disabled_weak_roots_keep_slots() {
    let heap = heap(false);
    let region = old_region_with_gaps(&heap);
    let slot = heap.weak_refs().register(region.first.offset(4));

    assert!(OldGc::new(Arc::clone(&heap)).collect(GcCause::Explicit));
    assert_eq!(heap.weak_refs().get(slot), Some(region.first.offset(4)));
    assert!(!heap.gc_state().is_concurrent_weak_root_in_progress());
}
