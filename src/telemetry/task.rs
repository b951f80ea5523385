//! Task execution span helpers.

use tracing::Span;

use crate::model::{Status, TaskRecord};

/// Start a span covering one claimed task from handler dispatch to its
/// final transition.
///
/// The `task.status` field is declared empty and filled in by
/// [`record_state_transition`].
pub fn start_task_span(worker_id: &str, task: &TaskRecord) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.id" = %task.id,
        "task.type" = %task.task_type,
        "worker.id" = worker_id,
        "task.status" = tracing::field::Empty,
    )
}

/// Record a status transition on `span` and emit a `state_transition` event
/// inside it.
pub fn record_state_transition(span: &Span, from: Status, to: Status) {
    span.record("task.status", to.as_str());
    span.in_scope(|| {
        tracing::info!(from = from.as_str(), to = to.as_str(), "state_transition");
    });
}
