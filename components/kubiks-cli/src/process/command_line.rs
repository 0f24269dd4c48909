// Local crates
use crate::helpers::errors::KubiksError;

// External crates
use std::fmt;

/// A command string split into program and arguments.
///
/// Splitting is on whitespace only. There is no shell: quotes, globs, pipes and variable
/// expansion are passed through to the program verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    raw: String,
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    /// Split `raw` into program and arguments; blank input is a configuration error
    pub fn parse(raw: &str) -> Result<Self, KubiksError> {
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| KubiksError::configuration("empty command"))?;

        Ok(Self {
            raw: raw.to_string(),
            program,
            args: parts.collect(),
        })
    }

    /// The command exactly as the user passed it
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// First word
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Every word after the first
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
