//! Diagnostic logging for kubiks itself.

/// Subscriber setup and panic hook
pub mod tracing;
