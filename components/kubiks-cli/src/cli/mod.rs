//! Command line surface.

/// Argument parsing and subcommand dispatch
pub mod cli;
