//! Metric instrument factories for dispatch-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"dispatch-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for dispatch-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("dispatch-rs")
}

/// Counter: admission decisions.
/// Labels: `origin`, `result` ("accepted" | "duplicate" | "rate_limited" | "closed").
pub fn work_admitted() -> Counter<u64> {
    meter()
        .u64_counter("dispatch.work.admitted")
        .with_description("Admission decisions for submitted work")
        .build()
}

/// Counter: work item state transitions.
/// Labels: `from`, `to`.
pub fn work_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("dispatch.work.state_transitions")
        .with_description("Number of work item state transitions")
        .build()
}

/// Counter: items moved to the dead-letter store.
/// Labels: `origin`.
pub fn work_dead_lettered() -> Counter<u64> {
    meter()
        .u64_counter("dispatch.work.dead_lettered")
        .with_description("Work items that exhausted their retries")
        .build()
}

/// Histogram: execution duration in milliseconds, per attempt.
/// Labels: `origin`, `outcome` ("succeeded" | "failed" | "timed_out").
pub fn execution_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("dispatch.work.execution_ms")
        .with_description("Execution duration per attempt")
        .with_unit("ms")
        .build()
}

/// Counter: cron firings.
/// Labels: `result` ("enqueued" | "duplicate" | "rejected").
pub fn cron_fired() -> Counter<u64> {
    meter()
        .u64_counter("dispatch.cron.fired")
        .with_description("Cron job firings")
        .build()
}

/// Counter: storage writes retried because the store was busy.
/// Labels: `operation`.
pub fn store_busy_retries() -> Counter<u64> {
    meter()
        .u64_counter("dispatch.store.busy_retries")
        .with_description("Storage-contention retries")
        .build()
}
