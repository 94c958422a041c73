//! Integration tests for interrupting and resuming the old cycle.
//!
//! Preemption is injected per region so that coalesce-and-fill stops at a
//! known candidate, independent of thread scheduling.

#![cfg(feature = "test-util")]

use std::sync::Arc;
use std::time::Duration;

use strata_gc::gc::{DegenPoint, GuardState, Regulator, RegulatorThread};
use strata_gc::test_util::{gap_is_filled, inject_preemption, old_region_with_gaps};
use strata_gc::{CycleOutcome, GcCause, GenerationalHeap, HeapConfig, OldGc, OldPhase};

fn heap(workers: usize) -> Arc<GenerationalHeap> {
    Arc::new(
        GenerationalHeap::new(HeapConfig {
            region_words: 256,
            num_regions: 32,
            max_tlab_words: 256,
            workers,
            initial_old_percent: 50,
            ..HeapConfig::default()
        })
        .expect("reserve heap"),
    )
}

/// Region indices of `count` gapped old regions, in candidate order.
fn gapped_regions(heap: &GenerationalHeap, count: usize) -> Vec<usize> {
    let mut regions: Vec<usize> = (0..count).map(|_| old_region_with_gaps(heap).index).collect();
    regions.sort_unstable();
    regions
}

#[test]
fn test_single_worker_resumes_where_it_stopped() {
    let heap = heap(1);
    let regions = gapped_regions(&heap, 6);
    let driver = OldGc::new(Arc::clone(&heap));
    inject_preemption(&heap, regions[2]);

    assert!(!driver.collect(GcCause::OldTrigger));
    assert_eq!(driver.degen_point(), DegenPoint::Unset);
    let filled: Vec<bool> = regions.iter().map(|&i| gap_is_filled(&heap, i)).collect();
    assert_eq!(filled, [true, true, false, false, false, false]);

    assert!(driver.collect(GcCause::OldTrigger));
    assert!(regions.iter().all(|&i| gap_is_filled(&heap, i)));
    assert_eq!(driver.last_metrics().map(|m| m.regions_filled), Some(4));
}

#[test]
fn test_repeated_preemption_eventually_completes() {
    let heap = heap(2);
    let regions = gapped_regions(&heap, 8);
    let driver = OldGc::new(Arc::clone(&heap));
    let state = heap.gc_state();

    let mut invocations = 0;
    let mut next_victim = 0;
    loop {
        if next_victim < regions.len() {
            inject_preemption(&heap, regions[next_victim]);
            next_victim += 3;
        }
        invocations += 1;
        if driver.collect(GcCause::OldTrigger) {
            break;
        }
        assert!(state.is_concurrent_prep_for_mixed_evacuation_in_progress());
        assert_eq!(
            driver.last_metrics().map(|m| m.outcome),
            Some(CycleOutcome::Preempted)
        );
        assert!(invocations < 10, "coalesce-and-fill never completed");
    }

    assert!(invocations > 1);
    assert!(!state.is_concurrent_prep_for_mixed_evacuation_in_progress());
    assert!(regions.iter().all(|&i| gap_is_filled(&heap, i)));
    assert_eq!(driver.phase(), OldPhase::EvacuationReady);
}

#[test]
fn test_young_preemption_during_fill_is_resumable() {
    let heap = heap(2);
    let regions = gapped_regions(&heap, 4);
    let driver = OldGc::new(Arc::clone(&heap));
    let regulator = Regulator::new(Arc::clone(&heap));

    // First pass stops at the injected region; the guard is clear afterwards.
    inject_preemption(&heap, regions[1]);
    assert!(!driver.collect(GcCause::OldTrigger));
    assert_eq!(heap.gc_state().old_preemption().state(), GuardState::Disallowed);
    assert!(!regulator.try_preempt_old(), "nothing to preempt between invocations");

    assert!(driver.collect(GcCause::OldTrigger));
    assert!(!heap.gc_state().cancelled_gc());
}

#[test]
fn test_cancelled_resumption_keeps_candidates() {
    let heap = heap(2);
    let regions = gapped_regions(&heap, 4);
    let driver = OldGc::new(Arc::clone(&heap));
    inject_preemption(&heap, regions[0]);
    assert!(!driver.collect(GcCause::OldTrigger));

    // A young cycle cancels the resumption before it starts filling.
    heap.gc_state().cancel_gc(GcCause::YoungPreemption);
    assert!(!driver.collect(GcCause::OldTrigger));
    assert_eq!(driver.degen_point(), DegenPoint::Evac);
    assert!(heap.gc_state().is_concurrent_prep_for_mixed_evacuation_in_progress());

    heap.gc_state().clear_cancelled_gc();
    assert!(driver.collect(GcCause::OldTrigger));
    assert!(regions.iter().all(|&i| gap_is_filled(&heap, i)));
}

#[test]
fn test_regulator_thread_against_running_driver() {
    let heap = heap(2);
    let regions = gapped_regions(&heap, 8);
    let driver = OldGc::new(Arc::clone(&heap));
    let regulator = RegulatorThread::spawn(
        Regulator::new(Arc::clone(&heap)),
        Duration::from_micros(50),
        || true,
    )
    .expect("spawn regulator");

    // Whatever the interleaving, each invocation either completes or leaves a
    // consistent, resumable state behind.
    let mut completed = false;
    for _ in 0..1000 {
        if driver.collect(GcCause::OldTrigger) {
            completed = true;
            break;
        }
        assert_eq!(driver.phase(), OldPhase::Idle);
        heap.gc_state().clear_cancelled_gc();
    }
    let _ = regulator.stop();
    heap.gc_state().clear_cancelled_gc();

    if !completed {
        assert!(driver.collect(GcCause::OldTrigger));
    }
    assert!(regions.iter().all(|&i| gap_is_filled(&heap, i)));
}
