//! Task execution span helpers.

use tracing::Span;

use crate::model::TaskId;

/// Start a span for one execution attempt.
///
/// `task.state` is declared empty and filled in by
/// [`record_state_transition`].
pub fn start_task_span(name: &str, task_id: &TaskId) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.name" = name,
        "task.id" = %task_id,
        "task.state" = tracing::field::Empty,
    )
}

/// Record a state change on the attempt's span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("task.state", to);
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "state_transition");
    });
}
