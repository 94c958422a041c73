//! The old-generation collector.
//!
//! - [`old_gc`]: the cycle driver and its phase state machine
//! - [`coalesce`]: parallel, preemptible coalesce-and-fill
//! - [`heuristics`]: old candidate selection and triggering
//! - [`state`]: cancellation, phase flags and the preemption guard
//! - [`regulator`]: preemption requests from young collections

pub mod coalesce;
pub mod heuristics;
pub mod mark;
pub mod old_gc;
pub mod regulator;
pub mod roots;
pub mod state;
pub mod strategy;
pub mod verify;
pub mod weak;
pub mod workers;

#[cfg(feature = "tracing")]
pub mod tracing;

pub use coalesce::CoalesceAndFillTask;
pub use heuristics::{OldGenHeuristics, OldHeuristics};
pub use mark::{ConcurrentMark, ParallelMark};
pub use old_gc::{HeapLockSafepoint, OldGc, OldPhase, Safepoint};
pub use regulator::{Regulator, RegulatorThread};
pub use state::{DegenPoint, GcCause, GcState, GuardState, PreemptionGuard, SharedFlag};
pub use strategy::CollectionStrategy;
pub use workers::{WorkerPool, WorkerScope, WorkerTask, WorkerThreads};
