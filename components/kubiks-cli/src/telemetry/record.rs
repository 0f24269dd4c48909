//! Internal log record model, independent of the OTLP wire types.

// External crates
use chrono::{DateTime, Utc};
use std::fmt;

// Attribute keys attached to exported records
/// Service the invocation reports as, on every record
pub const ATTR_SERVICE_NAME: &str = "service.name";
/// Raw command string, on every record
pub const ATTR_COMMAND: &str = "command";
/// [`EventType`] of the record
pub const ATTR_EVENT_TYPE: &str = "event.type";
/// [`OutputStream`] of an output record
pub const ATTR_STREAM: &str = "stream";
/// `success` or `error`, end record only
pub const ATTR_STATUS: &str = "status";
/// Failure description, end record with `status=error` only
pub const ATTR_ERROR_MESSAGE: &str = "error.message";

/// Lifecycle stage a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Queued before the child is spawned
    Start,
    /// One chunk of child output
    Output,
    /// Queued after the child has been reaped
    End,
}

impl EventType {
    /// Value of the `event.type` attribute
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "command.start",
            Self::Output => "command.output",
            Self::End => "command.end",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which pipe of the child an output chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Child's standard output
    Stdout,
    /// Child's standard error
    Stderr,
}

impl OutputStream {
    /// Value of the `stream` attribute
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse log level. Every record this tool produces is informational; the enum
/// exists so the OTLP severity number and text come from one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Severity {
    /// Every record
    #[default]
    Info,
}

impl Severity {
    /// OTLP `severity_text`
    pub const fn text(self) -> &'static str {
        match self {
            Self::Info => "INFO",
        }
    }

    /// OTLP `SeverityNumber` (INFO = 9)
    pub const fn number(self) -> i32 {
        match self {
            Self::Info => 9,
        }
    }
}

/// One structured log record, prior to wire conversion.
///
/// Attributes keep insertion order; keys are not deduplicated.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Creation time, exported as both time and observed time
    pub timestamp: DateTime<Utc>,
    /// Always [`Severity::Info`] for now
    pub severity: Severity,
    /// Message text; an output record carries the chunk itself
    pub body: String,
    /// String key/value pairs in insertion order
    pub attributes: Vec<(String, String)>,
}

impl LogRecord {
    /// Record stamped now, at INFO, without attributes
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity: Severity::Info,
            body: body.into(),
            attributes: Vec::new(),
        }
    }

    /// Append one attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    /// First value stored under `key`
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Parsed `event.type` attribute, if present and known
    pub fn event_type(&self) -> Option<EventType> {
        match self.attribute(ATTR_EVENT_TYPE)? {
            "command.start" => Some(EventType::Start),
            "command.output" => Some(EventType::Output),
            "command.end" => Some(EventType::End),
            _ => None,
        }
    }
}
