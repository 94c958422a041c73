//! Collector-wide signals: cancellation, phase flags and the preemption guard.
//!
//! Every flag here is a small state machine driven by compare-and-swap, so an
//! illegal transition (setting a flag that is already set, say) is caught in
//! debug builds instead of being silently absorbed by a blind store.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crossbeam::utils::Backoff;

/// Why a collection was requested or cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GcCause {
    /// No cause recorded.
    None = 0,
    /// A mutator allocation failed.
    AllocationFailure = 1,
    /// A GC thread could not allocate a copy during evacuation.
    AllocationFailureEvac = 2,
    /// The regulator interrupted an old cycle to run a young one.
    YoungPreemption = 3,
    /// Old-generation heuristics asked for a cycle.
    OldTrigger = 4,
    /// Requested through the API.
    Explicit = 5,
}

impl GcCause {
    #[must_use]
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::AllocationFailure,
            2 => Self::AllocationFailureEvac,
            3 => Self::YoungPreemption,
            4 => Self::OldTrigger,
            5 => Self::Explicit,
            _ => Self::None,
        }
    }
}

/// A boolean with checked transitions.
#[derive(Debug, Default)]
pub struct SharedFlag(AtomicBool);

impl SharedFlag {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sets the flag, returning whether this call changed it.
    pub fn try_set(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clears the flag, returning whether this call changed it.
    pub fn try_unset(&self) -> bool {
        self.0
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Sets the flag to `value` regardless of its current state.
    pub fn set_cond(&self, value: bool) {
        self.0.store(value, Ordering::Release);
    }
}

/// State of the [`PreemptionGuard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GuardState {
    /// The old cycle may not be interrupted.
    Disallowed = 0,
    /// A young collection may preempt the old cycle.
    Allowed = 1,
}

/// Declares that the old cycle may be preempted right now.
///
/// The driver sets it around interruptible phases. Clearing it is a race
/// between the driver finishing the phase and the regulator preempting; both
/// sides use [`try_unset`](Self::try_unset) and exactly one wins. The loser
/// must wait until it observes the cancellation the winner raises.
#[derive(Debug)]
pub struct PreemptionGuard(AtomicU8);

impl Default for PreemptionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl PreemptionGuard {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU8::new(GuardState::Disallowed as u8))
    }

    #[must_use]
    pub fn state(&self) -> GuardState {
        if self.0.load(Ordering::Acquire) == GuardState::Allowed as u8 {
            GuardState::Allowed
        } else {
            GuardState::Disallowed
        }
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.state() == GuardState::Allowed
    }

    /// Allows preemption. Only legal while preemption is disallowed.
    pub fn set(&self) {
        let prev = self.0.compare_exchange(
            GuardState::Disallowed as u8,
            GuardState::Allowed as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        debug_assert!(prev.is_ok(), "preemption guard set twice");
    }

    /// Disallows preemption. Returns `true` if this caller made the transition.
    pub fn try_unset(&self) -> bool {
        self.0
            .compare_exchange(
                GuardState::Allowed as u8,
                GuardState::Disallowed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Where a cancelled cycle hands over to a degenerated collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegenPoint {
    /// No cancellation recorded.
    Unset,
    /// Cancelled while resuming work between cycles.
    OutsideCycle,
    /// Cancelled during marking.
    Mark,
    /// Cancelled before evacuation or final roots.
    Evac,
}

/// Collector signals shared by the driver, workers, mutators and the regulator.
#[derive(Debug)]
pub struct GcState {
    cancelled: AtomicBool,
    cancel_cause: AtomicU8,
    concurrent_prep_for_mixed_evacuation: SharedFlag,
    concurrent_weak_root_in_progress: SharedFlag,
    evacuation_in_progress: SharedFlag,
    has_forwarded_objects: SharedFlag,
    old_preemption: PreemptionGuard,
}

impl Default for GcState {
    fn default() -> Self {
        Self::new()
    }
}

impl GcState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            cancel_cause: AtomicU8::new(GcCause::None as u8),
            concurrent_prep_for_mixed_evacuation: SharedFlag::new(),
            concurrent_weak_root_in_progress: SharedFlag::new(),
            evacuation_in_progress: SharedFlag::new(),
            has_forwarded_objects: SharedFlag::new(),
            old_preemption: PreemptionGuard::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------------

    #[must_use]
    pub fn cancelled_gc(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Cancels the running cycle. Returns `true` for the first canceller.
    pub fn cancel_gc(&self, cause: GcCause) -> bool {
        // Publish the cause before the flag so anyone who sees the flag sees it.
        let first = self
            .cancel_cause
            .compare_exchange(
                GcCause::None as u8,
                cause as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        self.cancelled.store(true, Ordering::Release);
        #[cfg(feature = "tracing")]
        if first {
            crate::gc::tracing::log_cancel(cause);
        }
        first
    }

    /// Cause of the current cancellation, [`GcCause::None`] if not cancelled.
    #[must_use]
    pub fn cancelled_cause(&self) -> GcCause {
        GcCause::from_u8(self.cancel_cause.load(Ordering::Acquire))
    }

    /// Clears cancellation before the next cycle.
    pub fn clear_cancelled_gc(&self) {
        self.cancelled.store(false, Ordering::Release);
        self.cancel_cause
            .store(GcCause::None as u8, Ordering::Release);
    }

    /// Spins until cancellation is visible.
    ///
    /// Only call this after losing a [`PreemptionGuard::try_unset`] race: the
    /// winner is the regulator, which cancels right after unsetting the guard,
    /// and that cancellation is the only thing that bounds this wait.
    pub fn wait_for_cancellation(&self) {
        let backoff = Backoff::new();
        while !self.cancelled_gc() {
            backoff.snooze();
        }
    }

    // ------------------------------------------------------------------------
    // Phase flags
    // ------------------------------------------------------------------------

    /// Coalesce-and-fill has started and not yet covered every candidate.
    #[must_use]
    pub fn is_concurrent_prep_for_mixed_evacuation_in_progress(&self) -> bool {
        self.concurrent_prep_for_mixed_evacuation.is_set()
    }

    pub fn set_concurrent_prep_for_mixed_evacuation_in_progress(&self, in_progress: bool) {
        let changed = if in_progress {
            self.concurrent_prep_for_mixed_evacuation.try_set()
        } else {
            self.concurrent_prep_for_mixed_evacuation.try_unset()
        };
        debug_assert!(
            changed,
            "mixed evacuation prep flag is already {}",
            if in_progress { "set" } else { "clear" }
        );
    }

    #[must_use]
    pub fn is_concurrent_weak_root_in_progress(&self) -> bool {
        self.concurrent_weak_root_in_progress.is_set()
    }

    pub fn set_concurrent_weak_root_in_progress(&self, in_progress: bool) {
        self.concurrent_weak_root_in_progress.set_cond(in_progress);
    }

    #[must_use]
    pub fn is_evacuation_in_progress(&self) -> bool {
        self.evacuation_in_progress.is_set()
    }

    pub fn set_evacuation_in_progress(&self, in_progress: bool) {
        self.evacuation_in_progress.set_cond(in_progress);
    }

    #[must_use]
    pub fn has_forwarded_objects(&self) -> bool {
        self.has_forwarded_objects.is_set()
    }

    pub fn set_has_forwarded_objects(&self, has: bool) {
        self.has_forwarded_objects.set_cond(has);
    }

    /// The guard that lets young collections preempt the old cycle.
    #[must_use]
    pub const fn old_preemption(&self) -> &PreemptionGuard {
        &self.old_preemption
    }
}
