//! Cross-cutting pieces used by every other module.

/// Internal records to OTLP messages
pub mod converters;
/// Error types for an invocation
pub mod errors;
/// Config file, environment layering and token persistence
pub mod load_config;
/// Cancellation handle and signal listener
pub mod shutdown;
