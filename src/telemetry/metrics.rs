//! Metric instrument factories for taskq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"taskq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("taskq")
}

/// Counter: enqueue attempts.
/// Labels: `queue`, `result` ("created" | "duplicate" | "buffered").
pub fn tasks_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("taskq.task.enqueued")
        .with_description("Number of task enqueue attempts")
        .build()
}

/// Counter: finished executions.
/// Labels: `queue`, `outcome` ("success" | "failure" | "cancelled").
pub fn tasks_executed() -> Counter<u64> {
    meter()
        .u64_counter("taskq.task.executed")
        .with_description("Number of task executions")
        .build()
}

/// Counter: raw queue operations.
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("taskq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: envelopes moved from a buffer into its work queue.
/// Labels: `queue`.
pub fn buffer_promoted() -> Counter<u64> {
    meter()
        .u64_counter("taskq.buffer.promoted")
        .with_description("Envelopes admitted from buffer to work queue")
        .build()
}

/// Counter: control-plane commands handled.
/// Labels: `verb`, `result` ("ok" | "error").
pub fn commands_processed() -> Counter<u64> {
    meter()
        .u64_counter("taskq.command.processed")
        .with_description("Number of control-plane commands handled")
        .build()
}

/// Counter: cron entries fired.
/// Labels: `function`.
pub fn cron_fired() -> Counter<u64> {
    meter()
        .u64_counter("taskq.cron.fired")
        .with_description("Number of cron entries fired")
        .build()
}

/// Histogram: task execution time in milliseconds.
/// Labels: `queue`, `function`.
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("taskq.task.duration_ms")
        .with_description("Task execution duration in milliseconds")
        .with_unit("ms")
        .build()
}
