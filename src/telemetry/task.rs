//! Task execution span helpers.

use tracing::Span;

use crate::model::DedupKey;

/// Start a span covering one task execution on one job thread.
///
/// `task.state` is declared empty and updated by
/// [`record_state_transition`].
pub fn start_task_span(target: &str, key: &DedupKey, thread: &str) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.target" = target,
        "task.key" = %key,
        "task.thread" = thread,
        "task.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the span and emit an event inside it.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("task.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
