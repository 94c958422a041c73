//! Integration tests for the preemption guard race between the old-cycle
//! driver and the regulator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

use strata_gc::gc::{GcCause, GcState, GuardState};

const ROUNDS: usize = 2000;

/// One round: the driver and the regulator both try to clear the guard.
/// The driver waits for cancellation if it loses. Returns who won.
fn race_once(state: &Arc<GcState>, barrier: &Arc<Barrier>) -> (bool, bool) {
    state.old_preemption().set();

    let regulator = {
        let state = Arc::clone(state);
        let barrier = Arc::clone(barrier);
        thread::spawn(move || {
            barrier.wait();
            if state.old_preemption().try_unset() {
                state.cancel_gc(GcCause::YoungPreemption);
                true
            } else {
                false
            }
        })
    };

    barrier.wait();
    let driver_won = state.old_preemption().try_unset();
    if !driver_won {
        state.wait_for_cancellation();
    }
    let regulator_won = regulator.join().expect("regulator panicked");
    (driver_won, regulator_won)
}

#[test]
fn test_exactly_one_side_wins_each_round() {
    let state = Arc::new(GcState::new());
    let barrier = Arc::new(Barrier::new(2));

    for _ in 0..ROUNDS {
        let (driver_won, regulator_won) = race_once(&state, &barrier);
        assert!(driver_won ^ regulator_won, "both or neither side won");
        assert_eq!(state.old_preemption().state(), GuardState::Disallowed);
        // Cancellation happens exactly when the regulator won.
        assert_eq!(state.cancelled_gc(), regulator_won);
        state.clear_cancelled_gc();
    }
}

#[test]
fn test_losing_driver_never_waits_forever() {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let state = Arc::new(GcState::new());
        let barrier = Arc::new(Barrier::new(2));
        for _ in 0..ROUNDS {
            let _ = race_once(&state, &barrier);
            state.clear_cancelled_gc();
        }
        let _ = tx.send(());
    });
    rx.recv_timeout(Duration::from_secs(60))
        .expect("driver stuck waiting for a cancellation that never came");
}

#[test]
fn test_many_preempters_one_winner() {
    let state = Arc::new(GcState::new());
    state.old_preemption().set();
    let winners = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let state = Arc::clone(&state);
            let winners = Arc::clone(&winners);
            thread::spawn(move || {
                if state.old_preemption().try_unset() {
                    winners.fetch_add(1, Ordering::Relaxed);
                    state.cancel_gc(GcCause::YoungPreemption);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("preempter panicked");
    }

    assert_eq!(winners.load(Ordering::Relaxed), 1);
    assert_eq!(state.cancelled_cause(), GcCause::YoungPreemption);
}
