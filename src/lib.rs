//! runlock - a locked, instrumented execution envelope for command-line jobs.
//!
//! A [`Command`] supplies the work. A [`CommandRunner`] wraps it with:
//!
//! - start/end/duration/memory logging through `tracing`
//! - a named lock so only one instance of a command runs at a time
//! - error and panic capture, reported as a [`RunOutcome`] instead of propagating
//!
//! # Example
//!
//! ```
//! use runlock::{CommandRunner, FnCommand, InMemoryLockStore, RunOutcome};
//! use std::sync::Arc;
//!
//! let runner = CommandRunner::new(Arc::new(InMemoryLockStore::new()));
//! let command = FnCommand::new("nightly-report", || Ok(()));
//!
//! let report = runner.run(&command, false);
//! assert_eq!(report.outcome, RunOutcome::Succeeded);
//! ```

pub mod core;
pub mod execution;
pub mod lock;

pub use crate::core::command::{Command, CommandError, FnCommand};
pub use crate::core::duration::format_clock;
pub use crate::core::memory::MemorySnapshot;
pub use crate::core::record::ExecutionRecord;
pub use execution::{CommandRunner, ProcessCommand, RunOutcome, RunReport};
pub use lock::{FileLockStore, InMemoryLockStore, LockError, LockGuard, LockMetadata, LockStore};
