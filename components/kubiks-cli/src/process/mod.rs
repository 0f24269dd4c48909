//! Child process handling.

/// Whitespace command splitting
pub mod command_line;
/// Spawn, forward output, wait, report
pub mod runner;
