//! Queueing and batching between the emitter and the exporter.

/// Bounded queue plus background export worker
pub mod batch_processor;
