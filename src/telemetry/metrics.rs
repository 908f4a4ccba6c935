//! Metric instrument factories for taskq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"taskq"` meter; without a
//! provider they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};

/// Returns the shared meter for taskq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("taskq")
}

/// Counter: tasks submitted.
/// Labels: `task_type`.
pub fn task_submitted() -> Counter<u64> {
    meter()
        .u64_counter("taskq.task.submitted")
        .with_description("Number of tasks submitted")
        .build()
}

/// Counter: tasks claimed by a worker.
pub fn task_claimed() -> Counter<u64> {
    meter()
        .u64_counter("taskq.task.claimed")
        .with_description("Number of tasks claimed by workers")
        .build()
}

/// Counter: tasks that finished execution.
/// Labels: `status` ("success" | "error").
pub fn task_completed() -> Counter<u64> {
    meter()
        .u64_counter("taskq.task.completed")
        .with_description("Number of tasks that finished execution")
        .build()
}

/// Counter: tasks canceled administratively.
pub fn task_canceled() -> Counter<u64> {
    meter()
        .u64_counter("taskq.task.canceled")
        .with_description("Number of tasks canceled")
        .build()
}

/// Up-down counter: tasks currently claimed.
pub fn tasks_in_progress() -> UpDownCounter<i64> {
    meter()
        .i64_up_down_counter("taskq.task.in_progress")
        .with_description("Tasks currently claimed by workers")
        .build()
}

/// Histogram: execution time from claim to removal, in milliseconds.
/// Labels: `status`.
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("taskq.task.duration_ms")
        .with_description("Task execution time in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: store-level operations (enqueue, peek, remove, cancel, ...).
/// Labels: `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("taskq.queue.operations")
        .with_description("Number of queue store operations")
        .build()
}
