//! Turning command events into log records.

/// Start, output and end records over a batch processor
pub mod emitter;
/// Internal log record model
pub mod record;
