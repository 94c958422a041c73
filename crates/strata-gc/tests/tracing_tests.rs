//! Integration tests for the tracing feature.
//!
//! A capturing layer records span names and event messages emitted while the
//! old-generation driver runs.

#![cfg(feature = "tracing")]

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::Registry;

use strata_gc::{Affiliation, GcCause, GenerationalHeap, HeapConfig, OldGc};

#[derive(Clone, Default)]
struct Captured {
    spans: Arc<Mutex<Vec<String>>>,
    events: Arc<Mutex<Vec<String>>>,
}

struct MessageVisitor<'a>(&'a mut String);

impl Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            *self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for Captured {
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        self.spans.lock().unwrap().push(attrs.metadata().name().to_owned());
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut message = String::new();
        event.record(&mut MessageVisitor(&mut message));
        self.events.lock().unwrap().push(message);
    }
}

fn heap() -> Arc<GenerationalHeap> {
    Arc::new(
        GenerationalHeap::new(HeapConfig {
            region_words: 256,
            num_regions: 16,
            max_tlab_words: 256,
            workers: 2,
            initial_old_percent: 50,
            ..HeapConfig::default()
        })
        .expect("reserve heap"),
    )
}

fn run_traced(f: impl FnOnce()) -> Captured {
    let captured = Captured::default();
    let subscriber = Registry::default().with(captured.clone());
    tracing::subscriber::with_default(subscriber, f);
    captured
}

#[test]
fn test_collection_emits_cycle_and_phase_spans() {
    let heap = heap();
    let obj = heap.allocate_object(Affiliation::Old, 16, 0).expect("old room");
    heap.roots().add(obj);

    let captured = run_traced(|| {
        assert!(OldGc::new(Arc::clone(&heap)).collect(GcCause::Explicit));
    });

    let spans = captured.spans.lock().unwrap();
    assert!(spans.iter().any(|s| s == "gc_collect"));
    assert!(spans.iter().filter(|s| *s == "gc_phase").count() >= 3);
    assert!(spans.iter().any(|s| s == "gc_pause"));

    let events = captured.events.lock().unwrap();
    for expected in ["old_gc_start", "phase_start", "phase_end", "free_set_status"] {
        assert!(
            events.iter().any(|e| e == expected),
            "missing {expected} in {events:?}"
        );
    }
    assert!(events.iter().any(|e| e.starts_with("After Old Mark")));
}

#[test]
fn test_abort_is_logged_with_cancel() {
    let heap = heap();
    heap.gc_state().cancel_gc(GcCause::AllocationFailure);

    let captured = run_traced(|| {
        assert!(!OldGc::new(Arc::clone(&heap)).collect(GcCause::OldTrigger));
    });

    let events = captured.events.lock().unwrap();
    assert!(events.iter().any(|e| e == "old_gc_abort"));
}

#[test]
fn test_old_trigger_is_logged() {
    let heap = heap();
    for _ in 0..3 {
        heap.allocate_object(Affiliation::Old, 256, 0).expect("old room");
    }

    let captured = run_traced(|| {
        assert!(heap.old_heuristics().should_start_gc(&heap));
    });

    let events = captured.events.lock().unwrap();
    assert!(events.iter().any(|e| e == "Trigger (OLD): Old has overgrown"));
}
