//! Collector-level tracing events.

#[cfg(feature = "tracing")]
use tracing::Span;

#[cfg(feature = "tracing")]
use crate::gc::state::{DegenPoint, GcCause};

/// Create a span for a stop-the-world operation.
#[cfg(feature = "tracing")]
pub fn span_pause(name: &'static str) -> Span {
    tracing::debug_span!("gc_pause", pause = name)
}

/// Log a cancellation request.
#[cfg(feature = "tracing")]
pub fn log_cancel(cause: GcCause) {
    tracing::info!(cause = ?cause, "cancel_gc");
}

/// Log the start of a driver invocation.
#[cfg(feature = "tracing")]
pub fn log_old_gc_start(cause: GcCause, resumed: bool) {
    tracing::info!(cause = ?cause, resumed, "old_gc_start");
}

/// Log an aborted driver invocation.
#[cfg(feature = "tracing")]
pub fn log_abort(point: DegenPoint) {
    tracing::info!(degen_point = ?point, "old_gc_abort");
}

/// Log that the driver resumes an interrupted coalesce-and-fill.
#[cfg(feature = "tracing")]
pub fn log_resume(candidates: usize) {
    tracing::info!(candidates, "resume_coalesce_and_fill");
}

/// Log the start of coalesce-and-fill.
#[cfg(feature = "tracing")]
pub fn log_coalesce_and_fill_start(candidates: usize, workers: usize) {
    tracing::debug!(candidates, workers, "coalesce_and_fill_start");
}

/// Log a preempted coalesce-and-fill.
#[cfg(feature = "tracing")]
pub fn log_coalesce_and_fill_suspended(filled: usize) {
    tracing::debug!(filled, "coalesce_and_fill_suspended");
}

/// Log the outcome of a generation balance.
#[cfg(feature = "tracing")]
pub fn log_transfer(
    when: &str,
    success: bool,
    region_count: usize,
    destination: &str,
    old_available: usize,
    young_available: usize,
) {
    tracing::info!(
        when,
        success,
        region_count,
        destination,
        old_available,
        young_available,
        "After {}, {} {} regions to {} to prepare for next gc",
        when,
        if success {
            "successfully transferred"
        } else {
            "failed to transfer"
        },
        region_count,
        destination
    );
}

/// Log free-set status.
#[cfg(feature = "tracing")]
pub fn log_free_set(empty_regions: usize, young_available: usize, old_available: usize) {
    tracing::info!(empty_regions, young_available, old_available, "free_set_status");
}

/// Log an old-generation trigger.
#[cfg(feature = "tracing")]
pub fn log_old_trigger(reason: &str, live_after_mark: usize, used: usize, growth_percent: usize) {
    tracing::info!(
        live_after_mark,
        used,
        growth_percent,
        "Trigger (OLD): {}",
        reason
    );
}

/// Log immediate garbage found at final mark.
#[cfg(feature = "tracing")]
pub fn log_old_candidates(mixed: usize, fill: usize, immediate_regions: usize) {
    tracing::debug!(mixed, fill, immediate_regions, "old_candidates");
}

/// Log PLAB resizing.
#[cfg(feature = "tracing")]
pub fn log_plab_size(words: usize) {
    tracing::trace!(words, "plab_size");
}
