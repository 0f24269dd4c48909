//! `kubiks` binary entrypoint.

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    // Tracing, panic hook and dispatch all live in the CLI layer
    kubiks_cli::cli::cli::run().await
}
