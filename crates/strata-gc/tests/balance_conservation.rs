//! Integration tests for moving capacity between generations.

use strata_gc::{Affiliation, GenerationalHeap, HeapConfig};

fn heap(num_regions: usize, initial_old_percent: usize) -> GenerationalHeap {
    GenerationalHeap::new(HeapConfig {
        region_words: 256,
        num_regions,
        max_tlab_words: 256,
        initial_old_percent,
        ..HeapConfig::default()
    })
    .expect("reserve heap")
}

fn assert_conserved(heap: &GenerationalHeap) {
    assert_eq!(
        heap.young().max_capacity_regions() + heap.old().max_capacity_regions(),
        heap.num_regions(),
        "region capacity leaked"
    );
}

#[test]
fn test_capacity_is_conserved_for_any_balance() {
    for balance in [-40_isize, -3, -1, 0, 1, 2, 7, 40] {
        let heap = heap(32, 25);
        heap.old().set_region_balance(balance);
        let result = heap.balance_generations(&mut heap.lock());
        assert_conserved(&heap);
        assert_eq!(heap.old().region_balance(), 0, "balance is consumed");
        if !result.success {
            assert_eq!(heap.old().max_capacity_regions(), 8);
        }
    }
}

#[test]
fn test_computed_balance_funds_young_from_idle_old() {
    let heap = heap(32, 25);
    heap.reset_generation_reserves();
    heap.compute_old_generation_balance(heap.young().available(), 0);
    // Nothing to evacuate or promote: every unaffiliated old region is surplus.
    assert_eq!(heap.old().region_balance(), 8);

    let result = heap.balance_generations(&mut heap.lock());
    assert_conserved(&heap);
    // Old may not shrink below num_regions - max_young (zero at 100%).
    assert!(result.success);
    assert_eq!(result.region_destination, "young");
    assert_eq!(heap.old().max_capacity_regions(), 0);
    assert_eq!(result.to_string(), "successfully transferred 8 regions to young");
}

#[test]
fn test_promotion_potential_keeps_old_regions() {
    let heap = heap(32, 25);
    heap.old().set_promotion_potential(3 * 256);
    heap.reset_generation_reserves();
    heap.compute_old_generation_balance(heap.young().available(), 0);

    assert!(heap.old().promoted_reserve() > 0);
    let balance = heap.old().region_balance();
    assert!((0..8).contains(&balance), "old keeps room for promotions, got {balance}");
}

#[test]
fn test_affiliated_regions_never_move() {
    let heap = heap(16, 50);
    for _ in 0..8 {
        heap.allocate_object(Affiliation::Old, 256, 0).expect("old room");
    }
    heap.old().set_region_balance(1);
    let result = heap.balance_generations(&mut heap.lock());
    assert!(!result.success);
    assert_eq!(heap.old().max_capacity_regions(), 8);
    assert_conserved(&heap);
}
