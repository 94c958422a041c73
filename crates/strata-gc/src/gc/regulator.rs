//! The regulator: the thread that decides when young collections interrupt
//! an old cycle.
//!
//! Preempting is one half of the guard race. The regulator clears the guard
//! with [`PreemptionGuard::try_unset`](crate::gc::state::PreemptionGuard::try_unset)
//! and, only if that succeeded, cancels the running cycle. If the driver
//! cleared the guard first, the old cycle has left its interruptible phase
//! and is not disturbed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::gc::state::GcCause;
use crate::generational::GenerationalHeap;

/// Preemption requests against one heap.
#[derive(Debug, Clone)]
pub struct Regulator {
    heap: Arc<GenerationalHeap>,
}

impl Regulator {
    #[must_use]
    pub const fn new(heap: Arc<GenerationalHeap>) -> Self {
        Self { heap }
    }

    /// Interrupts the old cycle if it is preemptible right now.
    ///
    /// Returns `true` if this call won the guard and cancelled the cycle.
    pub fn try_preempt_old(&self) -> bool {
        let state = self.heap.gc_state();
        if state.old_preemption().try_unset() {
            state.cancel_gc(GcCause::YoungPreemption);
            true
        } else {
            false
        }
    }

    /// Whether old heuristics want a new old cycle.
    #[must_use]
    pub fn should_start_old_gc(&self) -> bool {
        self.heap.old_heuristics().should_start_gc(&self.heap)
    }
}

/// A background thread polling a trigger and preempting old cycles.
#[derive(Debug)]
pub struct RegulatorThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<usize>>,
}

impl RegulatorThread {
    /// Starts polling `young_trigger` every `interval`. Whenever it returns
    /// `true` the regulator tries to preempt the old cycle.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    pub fn spawn<F>(regulator: Regulator, interval: Duration, mut young_trigger: F) -> std::io::Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("strata-regulator".into())
            .spawn(move || {
                let mut preemptions = 0;
                while !stop_flag.load(Ordering::Acquire) {
                    if young_trigger() && regulator.try_preempt_old() {
                        preemptions += 1;
                    }
                    std::thread::sleep(interval);
                }
                preemptions
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stops the thread and returns how many cycles it preempted.
    ///
    /// # Panics
    ///
    /// Re-raises a panic of the regulator thread.
    pub fn stop(mut self) -> usize {
        self.shutdown()
    }

    fn shutdown(&mut self) -> usize {
        self.stop.store(true, Ordering::Release);
        self.handle.take().map_or(0, |handle| {
            handle
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
        })
    }
}

impl Drop for RegulatorThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
