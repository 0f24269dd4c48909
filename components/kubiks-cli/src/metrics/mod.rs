//! Export counters.

/// Prometheus counters in a crate-local registry
pub mod metrics;
