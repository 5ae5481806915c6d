//! Metric instruments for engines-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`. With
//! no provider installed the instruments are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("engines-rs")
}

/// Counter: engine state transitions.
/// Labels: `engine`, `state`.
pub fn state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("engines.state_transitions")
        .with_description("Number of engine state transitions")
        .build()
}

/// Counter: periodic work invocations.
/// Labels: `engine`, `result` ("ok" | "error").
pub fn tick_executions() -> Counter<u64> {
    meter()
        .u64_counter("engines.tick.executions")
        .with_description("Number of periodic work invocations")
        .build()
}

/// Counter: leaf causes of failed work invocations (aggregates are flattened).
/// Labels: `engine`.
pub fn tick_failures() -> Counter<u64> {
    meter()
        .u64_counter("engines.tick.failures")
        .with_description("Number of errors raised by periodic work")
        .build()
}

/// Histogram: periodic work duration in milliseconds.
/// Labels: `engine`.
pub fn tick_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("engines.tick.duration_ms")
        .with_description("Periodic work duration in milliseconds")
        .with_unit("ms")
        .build()
}
