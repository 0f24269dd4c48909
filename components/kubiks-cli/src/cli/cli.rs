// Local crates
use crate::{
    helpers::{
        load_config::{self, Config},
        shutdown::Shutdown,
    },
    instrumentation,
    runtime::runtime::{self, RunSettings},
};

// External crates
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "kubiks",
    long_about = "Kubiks runs any command and streams its output and lifecycle to Kubiks as OpenTelemetry logs.",
    about = "Run commands with telemetry",
    version,
    term_width = 100,
    after_help = "\
    EXAMPLES:
        kubiks config add-authtoken YOUR_TOKEN
        kubiks run \"echo hello world\"
        kubiks run \"npm start\" --service-name web --tee"
)]
struct Cli {
    /// Path to the config file [default: ~/.config/kubiks/config.toml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Service name attached to every record [default: kubiks-subprocess]
    #[arg(long, global = true)]
    service_name: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a command, passed as a single quoted string
    Run {
        command: String,

        /// Also print the command's output locally
        #[arg(long)]
        tee: bool,
    },

    /// Manage the local configuration
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Display version information
    Version,
}

#[derive(Debug, Subcommand)]
enum ConfigCommands {
    /// Save the authentication token to the config file
    #[command(name = "add-authtoken")]
    AddAuthtoken { token: String },

    /// Show the resolved configuration, token masked
    Show,
}

/// Entry function for CLI
pub async fn run() -> ExitCode {
    let cli = Cli::parse();

    let _guard = instrumentation::tracing::init_tracing(cli.verbose);
    instrumentation::tracing::init_panic_handler();

    let result = dispatch(cli).await;
    if let Err(err) = &result {
        tracing::debug!(error = ?err, "kubiks exiting with error");
        eprintln!("Error: {err:#}");
    }
    ExitCode::from(runtime::exit_code(&result))
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_path()?,
    };

    match cli.command {
        Commands::Run { command, tee } => {
            let cfg = Config::load(&config_path)?;
            let settings = RunSettings {
                auth_token: cfg.auth_token.clone().unwrap_or_default(),
                service_name: cfg.resolve_service_name(cli.service_name.as_deref()),
                exporter: cfg.exporter,
                verbose: cli.verbose,
                tee,
                banners: true,
            };
            run_command(&command, &settings).await
        }
        Commands::Config(ConfigCommands::AddAuthtoken { token }) => {
            add_authtoken(&config_path, &token)
        }
        Commands::Config(ConfigCommands::Show) => {
            show_config(&config_path, cli.service_name.as_deref())
        }
        Commands::Version => {
            show_version();
            Ok(())
        }
    }
}

//
// ------------------------ Command Implementations ------------------------------
//

/// Run one command with Ctrl-C / SIGTERM wired to cancellation
async fn run_command(command: &str, settings: &RunSettings) -> Result<()> {
    let shutdown = Shutdown::new();
    let listener = shutdown.listen_for_signals();

    let result = runtime::run_invocation(command, settings, shutdown.token()).await;

    // Retires the signal listener; the invocation is already over.
    shutdown.trigger();
    if let Err(e) = listener.await {
        tracing::debug!(error = %e, "Signal listener task failed");
    }
    result
}

/// Persist the authentication token
fn add_authtoken(config_path: &Path, token: &str) -> Result<()> {
    load_config::save_auth_token(config_path, token)
        .context("failed to save authentication token")?;
    println!("Authentication token saved to {}", config_path.display());
    Ok(())
}

/// Print the resolved configuration
fn show_config(config_path: &Path, service_flag: Option<&str>) -> Result<()> {
    let cfg = Config::load(config_path)?;
    let exporter = &cfg.exporter;

    println!("Config file:        {}", config_path.display());
    println!(
        "Auth token:         {}",
        cfg.masked_token().unwrap_or_else(|| "<not set>".to_string())
    );
    println!("Service name:       {}", cfg.resolve_service_name(service_flag));
    println!("Endpoint:           {}", exporter.endpoint);
    println!("Connect timeout:    {:?}", exporter.connection_timeout());
    println!("Export timeout:     {:?}", exporter.export_timeout());
    println!("Max queue size:     {}", exporter.max_queue_size);
    println!("Max batch size:     {}", exporter.max_export_batch_size);
    println!("Scheduled delay:    {:?}", exporter.scheduled_delay());
    println!("Shutdown timeout:   {:?}", exporter.shutdown_timeout());
    Ok(())
}

/// Show version information
fn show_version() {
    println!("kubiks {}", env!("CARGO_PKG_VERSION"));
}
