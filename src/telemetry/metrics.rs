//! Metric instrument factories for qtask-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"qtask-rs"` meter; with no
//! provider installed they are no-ops.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

use crate::model::Status;

/// Returns the shared meter for qtask-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("qtask-rs")
}

/// Counter: number of tasks enqueued.
/// Labels: `task_type`.
pub fn task_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("qtask.task.enqueued")
        .with_description("Number of tasks enqueued")
        .build()
}

/// Counter: task status transitions.
/// Labels: `from`, `to`.
pub fn task_transitions() -> Counter<u64> {
    meter()
        .u64_counter("qtask.task.transitions")
        .with_description("Number of task status transitions")
        .build()
}

/// Counter: backend-level operations (push, claim, claim_empty).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("qtask.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: tasks claimed with no registered handler.
/// Labels: `task_type`.
pub fn task_unroutable() -> Counter<u64> {
    meter()
        .u64_counter("qtask.task.unroutable")
        .with_description("Tasks with no matching handler")
        .build()
}

/// Counter: expired leases returned to todo.
/// Labels: `task_type`.
pub fn lease_recovered() -> Counter<u64> {
    meter()
        .u64_counter("qtask.lease.recovered")
        .with_description("Expired leases requeued")
        .build()
}

/// Counter: entries removed by TTL sweeps.
/// Labels: `queue`, `status`.
pub fn ttl_swept() -> Counter<u64> {
    meter()
        .u64_counter("qtask.ttl.swept")
        .with_description("Entries removed by retention sweeps")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("qtask.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}

pub(crate) fn record_queue_operation(queue: &str, operation: &'static str) {
    queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

pub(crate) fn record_transition(from: Status, to: Status) {
    task_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}

pub(crate) fn record_swept(queue: &str, status: Status, removed: usize) {
    ttl_swept().add(
        removed as u64,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("status", status.as_str()),
        ],
    );
}
