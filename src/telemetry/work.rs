//! Work execution span helpers.
//!
//! Provides span creation and state-transition recording for work items
//! flowing through the worker pool.

use tracing::Span;

use crate::model::{Origin, WorkId};

/// Start a span for one execution attempt.
///
/// The `work.outcome` field is declared empty and filled in once the
/// attempt settles.
pub fn start_work_span(origin: Origin, id: WorkId, attempt: u32) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.origin" = %origin,
        "work.id" = %id,
        "work.attempt" = attempt,
        "work.outcome" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span and count it.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
    super::metrics::work_state_transitions().add(
        1,
        &[
            opentelemetry::KeyValue::new("from", from.to_string()),
            opentelemetry::KeyValue::new("to", to.to_string()),
        ],
    );
}

/// Record how the attempt ended.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("work.outcome", outcome);
}
