//! Old-generation cycle statistics.
//!
//! Each driver invocation records one [`OldGcMetrics`] snapshot, readable
//! afterwards through `OldGc::last_metrics`.

use std::time::{Duration, Instant};

use crate::gc::state::DegenPoint;

/// How a driver invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Candidates are ready for mixed evacuation.
    Completed,
    /// Coalesce-and-fill was interrupted; the next invocation resumes it.
    Preempted,
    /// Cancelled at the given degenerate point.
    Cancelled(DegenPoint),
}

/// Statistics of one driver invocation.
#[derive(Debug, Clone, Copy)]
pub struct OldGcMetrics {
    /// Time spent in each phase.
    pub phases: PhaseTimer,
    /// Total wall time.
    pub total: Duration,
    /// Regions coalesced and filled in this invocation.
    pub regions_filled: usize,
    /// Humongous candidates skipped.
    pub humongous_skipped: usize,
    /// This invocation resumed an interrupted coalesce-and-fill.
    pub resumed: bool,
    /// How the invocation ended.
    pub outcome: CycleOutcome,
}

impl OldGcMetrics {
    pub(crate) const fn new(resumed: bool) -> Self {
        Self {
            phases: PhaseTimer::new(),
            total: Duration::ZERO,
            regions_filled: 0,
            humongous_skipped: 0,
            resumed,
            outcome: CycleOutcome::Completed,
        }
    }
}

/// Timer for the phases of an old cycle.
///
/// ```
/// use strata_gc::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... marking ...
/// timer.end_mark();
/// assert!(timer.coalesce_and_fill.is_zero());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimer {
    /// Concurrent marking.
    pub mark: Duration,
    /// Final mark pause.
    pub final_mark: Duration,
    /// Weak reference and weak root processing.
    pub weak_roots: Duration,
    /// Early cleanup.
    pub cleanup: Duration,
    /// Coalesce-and-fill.
    pub coalesce_and_fill: Duration,
    current_start: Option<Instant>,
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTimer {
    /// Create a new `PhaseTimer` with all durations set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mark: Duration::ZERO,
            final_mark: Duration::ZERO,
            weak_roots: Duration::ZERO,
            cleanup: Duration::ZERO,
            coalesce_and_fill: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    fn take(&mut self) -> Duration {
        self.current_start
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }

    pub fn end_mark(&mut self) {
        self.mark = self.take();
    }

    pub fn end_final_mark(&mut self) {
        self.final_mark = self.take();
    }

    pub fn end_weak_roots(&mut self) {
        self.weak_roots = self.take();
    }

    pub fn end_cleanup(&mut self) {
        self.cleanup = self.take();
    }

    pub fn end_coalesce_and_fill(&mut self) {
        self.coalesce_and_fill = self.take();
    }

    /// Sum of all recorded phases.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.mark + self.final_mark + self.weak_roots + self.cleanup + self.coalesce_and_fill
    }
}
