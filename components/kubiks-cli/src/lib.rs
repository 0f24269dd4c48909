//! Kubiks CLI
//!
//! Runs an arbitrary command and ships its lifecycle and output to an OpenTelemetry
//! collector as OTLP log records over gRPC.
//!
//! The pieces, from the outside in:
//! - [`cli`]: argument parsing and subcommand dispatch
//! - [`runtime`]: one `kubiks run` invocation, from connect to final flush
//! - [`process`]: command line splitting and child process supervision
//! - [`telemetry`]: log record model and the emitter that turns events into records
//! - [`buffer_batcher`]: bounded queue plus background batch export worker
//! - [`shipper`]: OTLP/gRPC exporter with the authentication header
//! - [`helpers`]: configuration, errors, proto conversions and shutdown signalling
//! - [`metrics`]: process local prometheus counters
//! - [`instrumentation`]: diagnostic tracing setup

pub mod buffer_batcher;
pub mod cli;
pub mod helpers;
pub mod instrumentation;
pub mod metrics;
pub mod process;
pub mod proto;
pub mod runtime;
pub mod shipper;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod test_support;
