//! Error taxonomy for a single `kubiks` invocation.
//!
//! Three classes of failure are fatal for the invocation:
//! - `Configuration`: detected before any network activity, nothing to flush.
//! - `Transport`: the export channel could not be established, the child is never started.
//! - `CommandExecution`: the child failed; the end event is queued and the emitter flushed
//! before this error is returned to the CLI.
//!
//! Delivery failures inside the batch processor never show up here. They are logged and
//! counted by the processor itself, see [`crate::buffer_batcher`].

// External crates
use std::error::Error as StdError;
use std::io;
use std::process::ExitStatus;
use std::time::Duration;

/// Boxed source error carried by configuration failures
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Fatal failure of one invocation
#[derive(Debug, thiserror::Error)]
pub enum KubiksError {
    /// Bad or missing settings, raised before any network activity
    #[error("{message}")]
    Configuration {
        /// What is wrong, shown to the user as is
        message: String,
        /// Parse or IO error behind it, if any
        #[source]
        source: Option<BoxError>,
    },
    /// Export channel could not be established
    #[error("failed to establish export channel to {endpoint}")]
    Transport {
        /// Collector endpoint as configured
        endpoint: String,
        /// Underlying tonic error
        #[source]
        source: tonic::transport::Error,
    },
    /// The child did not run to a successful exit
    #[error("command `{command}` failed")]
    CommandExecution {
        /// Command string as passed to `kubiks run`
        command: String,
        /// How it failed
        #[source]
        source: CommandFailure,
    },
    /// Final flush ran past its deadline
    #[error("telemetry flush did not complete within {0:?}")]
    Shutdown(Duration),
}

/// Why the child process did not succeed
#[derive(Debug, thiserror::Error)]
pub enum CommandFailure {
    /// Program could not be started
    #[error("failed to start `{program}`")]
    Spawn {
        /// First word of the command line
        program: String,
        /// Spawn error from the OS
        #[source]
        source: io::Error,
    },
    /// Non-zero exit or killed by a signal
    #[error("{0}")]
    Exited(ExitStatus),
    /// Invocation token fired while the child was running
    #[error("cancelled before the command completed")]
    Cancelled,
    /// Reading a pipe or waiting on the child failed
    #[error("failed to read command output")]
    Io(#[source] io::Error),
}

impl KubiksError {
    /// Configuration failure without an underlying cause
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            source: None,
        }
    }

    /// Configuration failure wrapping the error that caused it
    pub fn configuration_with<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Configuration {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Process exit code for this failure. Mirrors the child's own exit code when it
    /// exited on its own with one, `1` for everything else.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::CommandExecution {
                source: CommandFailure::Exited(status),
                ..
            } => status
                .code()
                .and_then(|code| u8::try_from(code & 0xff).ok())
                .filter(|code| *code != 0)
                .unwrap_or(1),
            _ => 1,
        }
    }
}

/// Render an error and all of its sources on one line, `outer: inner: root`.
#[must_use]
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        let cause_text = cause.to_string();
        if !cause_text.is_empty() && !rendered.ends_with(&cause_text) {
            rendered.push_str(": ");
            rendered.push_str(&cause_text);
        }
        current = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_chain_joins_sources() {
        let err = KubiksError::CommandExecution {
            command: "missing-binary --flag".into(),
            source: CommandFailure::Spawn {
                program: "missing-binary".into(),
                source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
            },
        };

        assert_eq!(
            error_chain(&err),
            "command `missing-binary --flag` failed: failed to start `missing-binary`: No such file or directory"
        );
    }

    #[test]
    fn configuration_errors_exit_with_one() {
        let err = KubiksError::configuration("authentication token not found");
        assert_eq!(err.exit_code(), 1);
        assert!(StdError::source(&err).is_none());
    }

    #[test]
    fn cancelled_command_exits_with_one() {
        let err = KubiksError::CommandExecution {
            command: "sleep 30".into(),
            source: CommandFailure::Cancelled,
        };
        assert_eq!(err.exit_code(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn exited_command_mirrors_child_exit_code() {
        use std::os::unix::process::ExitStatusExt;

        // Raw wait status: exit code lives in the second byte.
        let err = KubiksError::CommandExecution {
            command: "sh -c exit".into(),
            source: CommandFailure::Exited(ExitStatus::from_raw(3 << 8)),
        };
        assert_eq!(err.exit_code(), 3);
    }
}
