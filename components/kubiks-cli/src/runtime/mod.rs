//! Invocation orchestration.

/// One `kubiks run`, from connect to final flush
pub mod runtime;
