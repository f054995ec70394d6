//! External program as a command.

use crate::core::command::{Command, CommandError};
use std::ffi::OsString;
use std::path::Path;
use tracing::debug;

/// Runs an external program with inherited stdio.
///
/// A non-zero exit status (or death by signal) is a [`CommandError::ExitStatus`].
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    name: String,
    program: OsString,
    args: Vec<OsString>,
}

impl ProcessCommand {
    /// Create a command named after the program's file name.
    pub fn new(program: impl Into<OsString>) -> Self {
        let program = program.into();
        let name = Path::new(&program)
            .file_name()
            .unwrap_or(program.as_os_str())
            .to_string_lossy()
            .into_owned();
        Self {
            name,
            program,
            args: Vec::new(),
        }
    }

    /// Override the command identity (and therefore the lock name).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn program_display(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

impl Command for ProcessCommand {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self) -> Result<(), CommandError> {
        debug!(program = %self.program_display(), args = ?self.args, "spawning");

        let status = std::process::Command::new(&self.program)
            .args(&self.args)
            .status()
            .map_err(|source| CommandError::Spawn {
                program: self.program_display(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(CommandError::ExitStatus {
                program: self.program_display(),
                exit_code: status.code(),
            })
        }
    }
}
