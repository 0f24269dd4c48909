//! Process Runner
//!
//! Executes one command line and redirects both of its output pipes into a
//! [`TelemetryEmitter`]. The runner owns the event sequence of an invocation:
//!
//! ```text
//! emit_start -> spawn -> forward stdout/stderr chunks -> wait for exit -> emit_end
//! ```
//!
//! Shutting the emitter down is left to the caller, who owns it; see
//! [`crate::runtime::runtime::run_invocation`].

// Local crates
use crate::{
    helpers::errors::{CommandFailure, KubiksError},
    process::command_line::CommandLine,
    telemetry::{emitter::TelemetryEmitter, record::OutputStream},
};

// External crates
use std::io::{self, Write};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

const READ_BUFFER_SIZE: usize = 16384;

/// Runner behaviour threaded in from the CLI
#[derive(Debug, Clone, Copy, Default)]
pub struct RunnerOptions {
    /// Also copy each chunk to this process's own stdout/stderr
    pub tee: bool,
}

/// Run `command` to completion with its output redirected into `emitter`.
///
/// `emit_start` is queued before the child exists and `emit_end` only after the child has
/// been reaped, so the end record always follows every output record. Cancelling `cancel`
/// kills the child; the end record is still queued, with the cancellation as its error.
#[instrument(
    name = "kubiks_runner::execute",
    target = "process::runner",
    skip_all,
    fields(program = %command.program()),
    level = "debug"
)]
pub async fn execute(
    command: &CommandLine,
    emitter: &TelemetryEmitter,
    options: RunnerOptions,
    cancel: &CancellationToken,
) -> Result<(), KubiksError> {
    emitter.emit_start();

    let outcome = supervise(command, emitter, options, cancel).await;

    emitter.emit_end(
        outcome
            .as_ref()
            .err()
            .map(|e| e as &(dyn std::error::Error + 'static)),
    );

    outcome.map_err(|source| {
        tracing::debug!(error = %source, "Command did not succeed");
        KubiksError::CommandExecution {
            command: command.raw().trim().to_string(),
            source,
        }
    })
}

async fn supervise(
    command: &CommandLine,
    emitter: &TelemetryEmitter,
    options: RunnerOptions,
    cancel: &CancellationToken,
) -> Result<(), CommandFailure> {
    if cancel.is_cancelled() {
        return Err(CommandFailure::Cancelled);
    }

    let mut child = Command::new(command.program())
        .args(command.args())
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CommandFailure::Spawn {
            program: command.program().to_string(),
            source,
        })?;
    tracing::debug!(pid = ?child.id(), "Spawned child process");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let finished = tokio::select! {
        _ = cancel.cancelled() => None,
        result = run_to_exit(&mut child, stdout, stderr, emitter, options) => Some(result),
    };

    match finished {
        Some(Ok(status)) if status.success() => {
            tracing::debug!(%status, "Child process exited successfully");
            Ok(())
        }
        Some(Ok(status)) => {
            tracing::debug!(%status, "Child process exited unsuccessfully");
            Err(CommandFailure::Exited(status))
        }
        Some(Err(failure)) => {
            terminate(&mut child).await;
            Err(failure)
        }
        None => {
            tracing::warn!("Invocation cancelled, terminating child process");
            terminate(&mut child).await;
            Err(CommandFailure::Cancelled)
        }
    }
}

/// Forward output until both pipes close, then reap the child.
async fn run_to_exit(
    child: &mut Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    emitter: &TelemetryEmitter,
    options: RunnerOptions,
) -> Result<ExitStatus, CommandFailure> {
    forward_output(stdout, stderr, emitter, options).await?;
    child.wait().await.map_err(CommandFailure::Io)
}

/// Read both pipes in one loop, forwarding each chunk as it arrives.
async fn forward_output(
    mut stdout: Option<ChildStdout>,
    mut stderr: Option<ChildStderr>,
    emitter: &TelemetryEmitter,
    options: RunnerOptions,
) -> Result<(), CommandFailure> {
    let mut stdout_buf = vec![0u8; READ_BUFFER_SIZE];
    let mut stderr_buf = vec![0u8; READ_BUFFER_SIZE];
    let mut stdout_open = stdout.is_some();
    let mut stderr_open = stderr.is_some();

    while stdout_open || stderr_open {
        tokio::select! {
            read = read_chunk(&mut stdout, &mut stdout_buf), if stdout_open => {
                match read.map_err(CommandFailure::Io)? {
                    0 => stdout_open = false,
                    n => forward(emitter, OutputStream::Stdout, &stdout_buf[..n], options),
                }
            }
            read = read_chunk(&mut stderr, &mut stderr_buf), if stderr_open => {
                match read.map_err(CommandFailure::Io)? {
                    0 => stderr_open = false,
                    n => forward(emitter, OutputStream::Stderr, &stderr_buf[..n], options),
                }
            }
        }
    }

    Ok(())
}

async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => Ok(0),
    }
}

fn forward(emitter: &TelemetryEmitter, stream: OutputStream, chunk: &[u8], options: RunnerOptions) {
    // Enqueue never fails; the result only exists to look like a writer.
    let _ = emitter.write(stream, chunk);

    if options.tee {
        let written = match stream {
            OutputStream::Stdout => io::stdout().lock().write_all(chunk),
            OutputStream::Stderr => io::stderr().lock().write_all(chunk),
        };
        if let Err(e) = written {
            tracing::debug!(error = %e, %stream, "Failed to mirror output to terminal");
        }
    }
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "Child process already gone");
    }
    if let Err(e) = child.wait().await {
        tracing::warn!(error = %e, "Failed to reap child process");
    }
}
