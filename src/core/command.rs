//! The command capability.
//!
//! A command is the unit of work wrapped by the runner: it has a stable name,
//! which doubles as its lock identity, and a single operation that may fail.

use std::fmt;
use thiserror::Error;

/// Errors a command can report from [`Command::execute`].
#[derive(Debug, Error)]
pub enum CommandError {
    /// Free-form failure message.
    #[error("{0}")]
    Message(String),

    /// I/O failure while doing the work.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// An external program could not be started.
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// An external program exited unsuccessfully.
    #[error("'{program}' exited with {}", .exit_code.map_or_else(|| "a signal".to_string(), |c| format!("status {}", c)))]
    ExitStatus {
        program: String,
        exit_code: Option<i32>,
    },

    /// The command panicked.
    #[error("{0}")]
    Panicked(String),
}

impl CommandError {
    /// Build a [`CommandError::Message`].
    pub fn msg(message: impl Into<String>) -> Self {
        CommandError::Message(message.into())
    }
}

/// A unit of work run inside the execution envelope.
pub trait Command {
    /// The command identity. Used in log messages and as the lock name.
    fn name(&self) -> &str;

    /// Perform the work.
    fn execute(&self) -> Result<(), CommandError>;
}

/// Adapts a closure into a [`Command`].
pub struct FnCommand<F> {
    name: String,
    operation: F,
}

impl<F> FnCommand<F>
where
    F: Fn() -> Result<(), CommandError>,
{
    pub fn new(name: impl Into<String>, operation: F) -> Self {
        Self {
            name: name.into(),
            operation,
        }
    }
}

impl<F> Command for FnCommand<F>
where
    F: Fn() -> Result<(), CommandError>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self) -> Result<(), CommandError> {
        (self.operation)()
    }
}

impl<F> fmt::Debug for FnCommand<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCommand")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
