//! Metric instrument factories.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments come from the `"taskmon"` meter. Without an OTLP
//! endpoint the global provider is a no-op and recording costs nothing.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("taskmon")
}

/// Counter: lifecycle events consumed by the monitor.
/// Labels: `type`.
pub fn events_received() -> Counter<u64> {
    meter()
        .u64_counter("taskmon.events.received")
        .with_description("Task events consumed by the monitor")
        .build()
}

/// Counter: lifecycle events published by workers and producers.
/// Labels: `type`.
pub fn events_emitted() -> Counter<u64> {
    meter()
        .u64_counter("taskmon.events.emitted")
        .with_description("Task events published")
        .build()
}

/// Counter: events that could not be decoded and were dropped.
pub fn events_malformed() -> Counter<u64> {
    meter()
        .u64_counter("taskmon.events.malformed")
        .with_description("Undecodable task events")
        .build()
}

/// Counter: transitions the reconciler flagged.
/// Labels: `kind`.
pub fn reconcile_anomalies() -> Counter<u64> {
    meter()
        .u64_counter("taskmon.reconcile.anomalies")
        .with_description("Task lifecycle anomalies seen by the monitor")
        .build()
}

/// Counter: final outcome of each execution attempt.
/// Labels: `task`, `outcome`.
pub fn task_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("taskmon.task.outcomes")
        .with_description("Task attempt outcomes")
        .build()
}

/// Counter: retries scheduled.
/// Labels: `task`.
pub fn task_retries() -> Counter<u64> {
    meter()
        .u64_counter("taskmon.task.retries")
        .with_description("Task retries scheduled")
        .build()
}

/// Counter: broker operations (send, read, delete, archive, set_vt).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("taskmon.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Histogram: handler runtime in milliseconds.
/// Labels: `task`.
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("taskmon.task.duration_ms")
        .with_description("Task handler runtime in milliseconds")
        .with_unit("ms")
        .build()
}
