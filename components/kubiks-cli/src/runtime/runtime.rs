// Local crates
use crate::{
    helpers::{errors::KubiksError, load_config::ExporterConfig},
    process::{
        command_line::CommandLine,
        runner::{self, RunnerOptions},
    },
    telemetry::emitter::TelemetryEmitter,
};

// External crates
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Where the collected logs can be browsed
pub const LOGS_URL: &str = "https://app.kubiks.ai/logs";

/// Everything one `kubiks run` needs, resolved by the CLI layer
#[derive(Debug, Clone, Default)]
pub struct RunSettings {
    /// Resolved token, may be empty; the emitter rejects it then
    pub auth_token: String,
    /// Resolved service name
    pub service_name: String,
    /// Transport and batching settings
    pub exporter: ExporterConfig,
    /// Echo the command line before running it
    pub verbose: bool,
    /// Mirror child output to the local terminal
    pub tee: bool,
    /// Print the start and success banners on stdout
    pub banners: bool,
}

/// One `kubiks run` invocation.
///
/// Order of work:
/// 1. split the command line, rejecting an empty one before touching the network
/// 2. connect the telemetry emitter; a transport failure means the child never starts
/// 3. run the child with its output redirected into the emitter
/// 4. flush the emitter within the shutdown deadline, on success and failure alike
///
/// The command's own failure wins over a flush that ran out of time; the latter is only
/// logged.
#[instrument(
    name = "kubiks_runtime::run_invocation",
    target = "runtime",
    skip_all,
    fields(service_name = %settings.service_name),
    level = "debug"
)]
pub async fn run_invocation(
    raw_command: &str,
    settings: &RunSettings,
    cancel: CancellationToken,
) -> Result<()> {
    let command = CommandLine::parse(raw_command)?;

    let mut emitter = TelemetryEmitter::connect(
        &settings.auth_token,
        &settings.service_name,
        raw_command,
        &settings.exporter,
        cancel.clone(),
    )
    .await
    .context("failed to create telemetry exporter")?;
    info!(endpoint = %settings.exporter.endpoint, "Telemetry exporter connected");

    if settings.verbose {
        println!("Running command: {command}");
    }
    if settings.banners {
        println!();
        println!("🚀 Running your command with Kubiks...");
        println!();
        println!("📊 View logs in real-time at: {LOGS_URL}");
        println!();
    }

    let options = RunnerOptions { tee: settings.tee };
    let outcome = runner::execute(&command, &emitter, options, &cancel).await;

    if let Err(e) = emitter
        .shutdown(settings.exporter.shutdown_timeout())
        .await
    {
        tracing::warn!(error = %e, "Telemetry flush incomplete, some records may be lost");
    }

    outcome?;

    if settings.banners {
        println!();
        println!("✨ Command executed successfully!");
        println!();
    }
    Ok(())
}

/// Exit status for an invocation result: 0 on success, the child's code when the command
/// failed with one, 1 for everything else.
pub fn exit_code(result: &Result<()>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(err) => err
            .downcast_ref::<KubiksError>()
            .map_or(1, KubiksError::exit_code),
    }
}
