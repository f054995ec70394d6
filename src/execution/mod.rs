//! Command execution.
//!
//! This module provides the execution envelope ([`CommandRunner`]) and a
//! concrete command that runs an external program ([`ProcessCommand`]).

mod process;
mod runner;

pub use process::ProcessCommand;
pub use runner::{CommandRunner, LOCKED_MESSAGE, RunOutcome, RunReport};
