//! Task execution span helpers.

use tracing::Span;

use crate::model::Task;

/// Start a span covering one task execution by a worker.
///
/// `task.status` is declared empty and filled by [`record_state_transition`].
pub fn start_task_span(task: &Task, worker_id: &str) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.id" = %task.id,
        "task.type" = %task.task_type,
        "task.component" = task.component_id.as_deref().unwrap_or("-"),
        "task.attempt" = task.execution_count,
        "worker.id" = worker_id,
        "task.status" = tracing::field::Empty,
    )
}

/// Record a state transition on the span and emit it as an event.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("task.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
