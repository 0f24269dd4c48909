use std::panic;
use std::path::PathBuf;
use tracing::error;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    filter::{Directive, EnvFilter},
    fmt,
    prelude::*,
    registry::Registry,
};

/// Span targets used across the crate, raised to `debug` by `--verbose`
const CRATE_TARGETS: [&str; 8] = [
    "kubiks_cli",
    "cli",
    "runtime",
    "process",
    "telemetry",
    "buffer_batcher",
    "shipper",
    "helpers",
];

/// Diagnostic log directory, `$XDG_STATE_HOME/kubiks` or the platform equivalent
pub fn log_dir() -> Option<PathBuf> {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|dir| dir.join("kubiks"))
}

fn build_filter(verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let mut filter = EnvFilter::new("warn");
    if verbose {
        for target in CRATE_TARGETS {
            if let Ok(directive) = format!("{target}=debug").parse::<Directive>() {
                filter = filter.add_directive(directive);
            }
        }
    }
    filter
}

/// Install the global subscriber.
///
/// Human readable lines go to stderr so they never mix with the child's mirrored stdout.
/// JSON lines go to a daily rolling file under [`log_dir`] when it can be created. The
/// returned guard flushes that file on drop and must live until the process exits.
pub fn init_tracing(verbose: bool) -> Option<WorkerGuard> {
    let filter = build_filter(verbose);

    let fmt_layer = fmt::layer()
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    let file_appender = log_dir().and_then(|dir| {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("kubiks")
            .filename_suffix("log")
            .build(dir)
            .ok()
    });
    let (json_layer, guard) = match file_appender {
        Some(appender) => {
            let (non_blocking_writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(non_blocking_writer)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(true)
                .with_target(true)
                .with_timer(fmt::time::UtcTime::rfc_3339());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let error_layer = ErrorLayer::default();

    let subscriber = Registry::default()
        .with(filter)
        .with(fmt_layer)
        .with(json_layer)
        .with(error_layer);

    // A subscriber may already be installed when embedded or under test
    if subscriber.try_init().is_err() {
        return None;
    }
    guard
}

/// Log panics through `tracing` before the default hook prints them
pub fn init_panic_handler() {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let payload = panic_info.payload();
        let msg = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("Unknown panic");

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            message = %msg,
            location = %location,
            "Application panicked!"
        );
        default_hook(panic_info);
    }));
}
