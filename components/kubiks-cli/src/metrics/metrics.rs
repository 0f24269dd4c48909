//! Process-local export counters.
//!
//! There is no `/metrics` endpoint. The counters are summarised in the debug log when the
//! emitter shuts down.

// Metric names and help strings are static literals, registration cannot fail.
#![allow(clippy::expect_used)]

// External crates
use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::time::Instant;

/// Helper to observe histogram duration
pub fn observe_duration(hist: &Histogram, start: Instant) {
    hist.observe(start.elapsed().as_secs_f64());
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid counter definition");
    registry
        .register(Box::new(counter.clone()))
        .expect("counter registered once");
    counter
}

lazy_static! {
    /// Registry owned by this crate, kept apart from the prometheus default registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Records accepted into the batch processor queue
    pub static ref RECORDS_QUEUED_TOTAL: IntCounter = counter(
        &REGISTRY,
        "kubiks_records_queued_total",
        "Log records accepted into the export queue"
    );

    /// Records rejected because the queue was full or already shut down
    pub static ref RECORDS_DROPPED_TOTAL: IntCounter = counter(
        &REGISTRY,
        "kubiks_records_dropped_total",
        "Log records dropped before export"
    );

    /// Records the collector acknowledged
    pub static ref RECORDS_EXPORTED_TOTAL: IntCounter = counter(
        &REGISTRY,
        "kubiks_records_exported_total",
        "Log records successfully exported"
    );

    /// Export calls that failed, timed out or were cancelled
    pub static ref EXPORT_FAILURES_TOTAL: IntCounter = counter(
        &REGISTRY,
        "kubiks_export_failures_total",
        "Failed export calls"
    );

    /// Wall time of individual export calls
    pub static ref EXPORT_DURATION_SECONDS: Histogram = {
        let hist = Histogram::with_opts(
            HistogramOpts::new(
                "kubiks_export_duration_seconds",
                "Histogram of export call durations in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        )
        .expect("valid histogram definition");
        REGISTRY
            .register(Box::new(hist.clone()))
            .expect("histogram registered once");
        hist
    };
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// Records accepted into the queue
    pub queued: u64,
    /// Records rejected before export
    pub dropped: u64,
    /// Records acknowledged by the collector
    pub exported: u64,
    /// Failed export calls
    pub export_failures: u64,
}

/// Read every counter once
pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        queued: RECORDS_QUEUED_TOTAL.get(),
        dropped: RECORDS_DROPPED_TOTAL.get(),
        exported: RECORDS_EXPORTED_TOTAL.get(),
        export_failures: EXPORT_FAILURES_TOTAL.get(),
    }
}
