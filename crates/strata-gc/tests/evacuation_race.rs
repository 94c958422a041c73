//! Integration tests for threads racing to evacuate the same objects.

use std::sync::atomic::Ordering;

use strata_gc::gc::verify::Verifier;
use strata_gc::object::{mark_word, MarkWord};
use strata_gc::{Address, Affiliation, GcThreadLocal, GenerationalHeap, HeapConfig};

const THREADS: usize = 4;
const OBJECTS: usize = 200;

fn heap() -> GenerationalHeap {
    GenerationalHeap::new(HeapConfig {
        region_words: 1024,
        num_regions: 16,
        max_tlab_words: 512,
        plab_min_words: 100,
        initial_old_percent: 50,
        ..HeapConfig::default()
    })
    .expect("reserve heap")
}

/// Every thread evacuates every object; returns each thread's answers.
fn race(heap: &GenerationalHeap, objects: &[Address]) -> Vec<Vec<Address>> {
    heap.begin_evacuation();
    let results = crossbeam::thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                s.spawn(move |_| {
                    let mut tl = GcThreadLocal::new();
                    // Start at different offsets to spread the contention.
                    let mut copies = vec![Address::new(0); objects.len()];
                    for i in 0..objects.len() {
                        let at = (i + t * 17) % objects.len();
                        copies[at] = heap.evacuate_object(&mut tl, objects[at]);
                    }
                    heap.retire_thread_labs(&mut tl);
                    copies
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("evacuating thread panicked"))
            .collect()
    })
    .expect("scope");
    heap.end_evacuation();
    results
}

#[test]
fn test_all_threads_agree_on_one_copy() {
    let heap = heap();
    let objects: Vec<Address> = (0..OBJECTS)
        .map(|_| heap.allocate_object(Affiliation::Young, 8, 0).expect("young"))
        .collect();

    let results = race(&heap, &objects);
    for (i, &obj) in objects.iter().enumerate() {
        let winner = heap.resolve_forwarded(obj);
        assert_ne!(winner, obj, "object {i} was not evacuated");
        for copies in &results {
            assert_eq!(copies[i], winner, "threads disagree on object {i}");
        }
    }
    assert!(!heap.gc_state().cancelled_gc());

    // Losing copies were undone or filled: young regions still walk cleanly.
    let verifier = Verifier::new(&heap);
    for region in heap.regions() {
        if region.is_young() {
            verifier.verify_region_parsable(region);
        }
    }
}

#[test]
fn test_racing_promotions_charge_the_reserve_once() {
    let heap = heap();
    heap.old().set_promoted_reserve(16 * 1024);
    let objects: Vec<Address> = (0..OBJECTS)
        .map(|_| {
            let obj = heap.allocate_object(Affiliation::Young, 8, 0).expect("young");
            heap.words()[obj.to_usize()].store(MarkWord::prototype().with_age(15).raw(), Ordering::Relaxed);
            obj
        })
        .collect();

    let _ = race(&heap, &objects);
    for &obj in &objects {
        assert!(mark_word(heap.words(), obj.to_usize()).is_forwarded());
        assert!(heap.region_containing(heap.resolve_forwarded(obj)).is_old());
    }
    assert_eq!(heap.promoted_words(), OBJECTS * 8);
    assert!(heap.old().promoted_expended() <= heap.old().promoted_reserve());
    assert_eq!(heap.outstanding_plabs(), 0);
    Verifier::new(&heap).verify_old_regions_parsable();
}
