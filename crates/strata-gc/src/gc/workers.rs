//! Parallel GC worker pool.
//!
//! A [`WorkerTask`] is run by every active worker, each receiving its worker
//! id. [`WorkerThreads`] runs tasks on scoped threads so a task can borrow
//! from the caller's stack (the candidate list, the heap) without `Arc`.

use std::sync::atomic::{AtomicUsize, Ordering};

/// A job executed once per active worker.
pub trait WorkerTask: Sync {
    /// Short name for logging.
    fn name(&self) -> &'static str;

    /// Runs the share of worker `worker_id` in `0..active_workers`.
    fn work(&self, worker_id: usize);
}

/// Something that can run a [`WorkerTask`] across several workers.
pub trait WorkerPool: Sync {
    /// Number of workers the next [`run_task`](Self::run_task) uses.
    fn active_workers(&self) -> usize;

    /// Runs `task` on every active worker and returns once all of them
    /// finished. Writes made by workers happen-before the return.
    fn run_task(&self, task: &dyn WorkerTask);
}

/// A pool of scoped OS threads.
#[derive(Debug)]
pub struct WorkerThreads {
    max_workers: usize,
    active: AtomicUsize,
}

impl WorkerThreads {
    /// Create a pool of up to `max_workers` threads, all active.
    ///
    /// # Panics
    ///
    /// Panics if `max_workers` is zero.
    #[must_use]
    pub fn new(max_workers: usize) -> Self {
        assert!(max_workers > 0, "worker pool needs at least one worker");
        Self {
            max_workers,
            active: AtomicUsize::new(max_workers),
        }
    }

    #[must_use]
    pub const fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Set how many workers run the next task. Returns the previous count.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero or above the pool size.
    pub fn set_active_workers(&self, workers: usize) -> usize {
        assert!(
            (1..=self.max_workers).contains(&workers),
            "{workers} active workers requested from a pool of {}",
            self.max_workers
        );
        self.active.swap(workers, Ordering::AcqRel)
    }
}

impl WorkerPool for WorkerThreads {
    fn active_workers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn run_task(&self, task: &dyn WorkerTask) {
        let workers = self.active_workers();
        if workers == 1 {
            task.work(0);
            return;
        }
        crossbeam::thread::scope(|scope| {
            let handles: Vec<_> = (1..workers)
                .map(|worker_id| scope.spawn(move |_| task.work(worker_id)))
                .collect();
            task.work(0);
            for handle in handles {
                if let Err(panic) = handle.join() {
                    std::panic::resume_unwind(panic);
                }
            }
        })
        .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
    }
}

/// Temporarily changes a pool's active worker count.
///
/// The previous count is restored on drop.
#[derive(Debug)]
pub struct WorkerScope<'a> {
    pool: &'a WorkerThreads,
    previous: usize,
}

impl<'a> WorkerScope<'a> {
    pub fn new(pool: &'a WorkerThreads, workers: usize) -> Self {
        let previous = pool.set_active_workers(workers.clamp(1, pool.max_workers()));
        Self { pool, previous }
    }
}

impl Drop for WorkerScope<'_> {
    fn drop(&mut self) {
        self.pool.set_active_workers(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Record(Mutex<Vec<usize>>);

    impl WorkerTask for Record {
        fn name(&self) -> &'static str {
            "record"
        }

        fn work(&self, worker_id: usize) {
            self.0.lock().push(worker_id);
        }
    }

    #[test]
    fn test_every_active_worker_runs_once() {
        let pool = WorkerThreads::new(4);
        let task = Record(Mutex::new(Vec::new()));
        pool.run_task(&task);
        let mut ids = task.0.into_inner();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_scope_restores_worker_count() {
        let pool = WorkerThreads::new(4);
        {
            let _scope = WorkerScope::new(&pool, 2);
            assert_eq!(pool.active_workers(), 2);
            let task = Record(Mutex::new(Vec::new()));
            pool.run_task(&task);
            assert_eq!(task.0.lock().len(), 2);
        }
        assert_eq!(pool.active_workers(), 4);
    }

    #[test]
    #[should_panic(expected = "worker failed")]
    fn test_worker_panic_propagates() {
        struct Fail;
        impl WorkerTask for Fail {
            fn name(&self) -> &'static str {
                "fail"
            }
            fn work(&self, worker_id: usize) {
                assert!(worker_id != 1, "worker failed");
            }
        }
        WorkerThreads::new(2).run_task(&Fail);
    }
}
