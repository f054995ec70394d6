//! The execution envelope.
//!
//! [`CommandRunner::run`] goes through `Locking -> Running -> Finalizing`:
//!
//! 1. Log the start time and memory.
//! 2. Unless told to skip it, take the lock named after the command. If the
//!    lock is held elsewhere the command is not run.
//! 3. Run the command, catching errors and panics.
//! 4. Log end memory, peak memory, end time and duration, then release the lock.
//!
//! No failure crosses `run`: every outcome is logged and returned as a
//! [`RunOutcome`].

use crate::core::command::{Command, CommandError};
use crate::core::memory::Bytes;
use crate::core::record::{ExecutionRecord, RecordBuilder, TIMESTAMP_FORMAT};
use crate::lock::{LockError, LockGuard, LockStore};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Reported when the lock is held and skipping it was not requested.
pub const LOCKED_MESSAGE: &str =
    "The script is locked. Use the option --skip-lock if you wish to force the script to run.";

const SUCCESS_MESSAGE: &str = "You have executed this command successfully!";

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The command ran and returned `Ok`.
    Succeeded,
    /// The lock was held elsewhere; the command did not run.
    LockContended { name: String },
    /// The command (or the lock store) failed.
    Failed { message: String },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }

    /// Process exit code for callers that surface the outcome.
    ///
    /// `75` (`EX_TEMPFAIL`) for contention, `1` for failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Succeeded => 0,
            RunOutcome::LockContended { .. } => 75,
            RunOutcome::Failed { .. } => 1,
        }
    }
}

/// Outcome of a run together with its measurements.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub record: ExecutionRecord,
}

/// Wraps commands with locking, instrumentation and error capture.
#[derive(Clone)]
pub struct CommandRunner {
    store: Arc<dyn LockStore>,
}

impl CommandRunner {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    /// Run `command` inside the envelope.
    ///
    /// With `skip_lock` set the lock store is never consulted.
    pub fn run(&self, command: &dyn Command, skip_lock: bool) -> RunReport {
        let name = command.name();
        let builder = RecordBuilder::start();

        info!(
            command = %name,
            "Job Started : {}",
            builder.started_at().format(TIMESTAMP_FORMAT)
        );
        info!(
            command = %name,
            "Memory at the beginning : {}",
            Bytes(builder.memory_at_start())
        );

        let (outcome, guard) = match self.lock(name, skip_lock) {
            Ok(guard) => (invoke(command), guard),
            Err(outcome) => (outcome, None),
        };

        let record = builder.finish();
        info!(command = %name, "Memory at the end : {}", Bytes(record.memory_at_end));
        info!(command = %name, "Peak memory : {}", Bytes(record.peak_memory));
        info!(
            command = %name,
            "Job Ended : {}",
            record.ended_at.format(TIMESTAMP_FORMAT)
        );
        info!(
            command = %name,
            "Job took {} to execute",
            record.duration_clock()
        );

        drop(guard);

        RunReport { outcome, record }
    }

    fn lock(&self, name: &str, skip_lock: bool) -> Result<Option<LockGuard>, RunOutcome> {
        if skip_lock {
            debug!(command = %name, "lock skipped");
            return Ok(None);
        }

        match LockGuard::acquire(Arc::clone(&self.store), name) {
            Ok(guard) => Ok(Some(guard)),
            Err(LockError::Contended { name: lock }) => {
                critical(name, LOCKED_MESSAGE);
                Err(RunOutcome::LockContended { name: lock })
            }
            Err(e) => {
                let message = e.to_string();
                critical(name, &message);
                Err(RunOutcome::Failed { message })
            }
        }
    }
}

impl std::fmt::Debug for CommandRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRunner").finish_non_exhaustive()
    }
}

fn invoke(command: &dyn Command) -> RunOutcome {
    let result = panic::catch_unwind(AssertUnwindSafe(|| command.execute()))
        .unwrap_or_else(|payload| Err(CommandError::Panicked(panic_message(payload.as_ref()))));

    match result {
        Ok(()) => {
            info!(command = %command.name(), "{}", SUCCESS_MESSAGE);
            RunOutcome::Succeeded
        }
        Err(e) => {
            let message = e.to_string();
            critical(command.name(), &message);
            RunOutcome::Failed { message }
        }
    }
}

/// `tracing` has no level above ERROR; critical entries carry a severity field.
fn critical(name: &str, message: &str) {
    error!(
        severity = "critical",
        command = %name,
        "{} : System Crash. Error : {}",
        name,
        message
    );
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "command panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::FnCommand;
    use crate::lock::InMemoryLockStore;
    use std::cell::Cell;
    use std::fmt;
    use std::sync::Mutex;
    use tracing::field::{Field, Visit};
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<(Level, String)>>>);

    impl Captured {
        fn entries(&self) -> Vec<(Level, String)> {
            self.0.lock().unwrap().clone()
        }

        fn count(&self, level: Level, needle: &str) -> usize {
            self.entries()
                .iter()
                .filter(|(l, m)| *l == level && m.contains(needle))
                .count()
        }
    }

    struct MessageVisitor(String);

    impl Visit for MessageVisitor {
        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            if field.name() == "message" {
                self.0 = format!("{:?}", value);
            }
        }
    }

    impl<S: Subscriber> Layer<S> for Captured {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let mut visitor = MessageVisitor(String::new());
            event.record(&mut visitor);
            self.0
                .lock()
                .unwrap()
                .push((*event.metadata().level(), visitor.0));
        }
    }

    fn run_captured(
        runner: &CommandRunner,
        command: &dyn Command,
        skip_lock: bool,
    ) -> (RunReport, Captured) {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::registry().with(captured.clone());
        let report =
            tracing::subscriber::with_default(subscriber, || runner.run(command, skip_lock));
        (report, captured)
    }

    /// Lock store that records every call.
    #[derive(Default)]
    struct RecordingStore {
        inner: InMemoryLockStore,
        calls: Mutex<Vec<String>>,
    }

    impl RecordingStore {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl LockStore for RecordingStore {
        fn try_acquire(&self, name: &str) -> Result<(), LockError> {
            self.calls.lock().unwrap().push(format!("acquire:{}", name));
            self.inner.try_acquire(name)
        }

        fn release(&self, name: &str) -> Result<(), LockError> {
            self.calls.lock().unwrap().push(format!("release:{}", name));
            self.inner.release(name)
        }

        fn is_held(&self, name: &str) -> Result<bool, LockError> {
            self.inner.is_held(name)
        }
    }

    /// Lock store whose acquire always fails with an I/O error.
    struct BrokenStore;

    impl LockStore for BrokenStore {
        fn try_acquire(&self, _name: &str) -> Result<(), LockError> {
            Err(LockError::Io {
                path: "/locks/job.lock".into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            })
        }

        fn release(&self, _name: &str) -> Result<(), LockError> {
            Ok(())
        }

        fn is_held(&self, _name: &str) -> Result<bool, LockError> {
            Ok(false)
        }
    }

    #[test]
    fn test_success_acquires_runs_and_releases() {
        let store = Arc::new(RecordingStore::default());
        let runner = CommandRunner::new(store.clone());
        let ran = Cell::new(false);
        let command = FnCommand::new("report", || {
            assert!(store.inner.is_held("report").unwrap());
            ran.set(true);
            Ok(())
        });

        let (report, logs) = run_captured(&runner, &command, false);

        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert!(ran.get());
        assert_eq!(store.calls(), vec!["acquire:report", "release:report"]);
        assert!(!store.is_held("report").unwrap());
        assert_eq!(logs.count(Level::INFO, "Job Started : "), 1);
        assert_eq!(logs.count(Level::INFO, "Job Ended : "), 1);
        assert_eq!(logs.count(Level::INFO, SUCCESS_MESSAGE), 1);
        assert_eq!(logs.count(Level::ERROR, ""), 0);
    }

    #[test]
    fn test_failure_is_logged_and_lock_released() {
        let store = Arc::new(RecordingStore::default());
        let runner = CommandRunner::new(store.clone());
        let command = FnCommand::new("import", || Err(CommandError::msg("disk full")));

        let (report, logs) = run_captured(&runner, &command, false);

        assert_eq!(
            report.outcome,
            RunOutcome::Failed {
                message: "disk full".to_string()
            }
        );
        assert_eq!(
            logs.count(Level::ERROR, "import : System Crash. Error : disk full"),
            1
        );
        assert_eq!(logs.count(Level::INFO, SUCCESS_MESSAGE), 0);
        assert_eq!(store.calls(), vec!["acquire:import", "release:import"]);
        assert!(!store.is_held("import").unwrap());
    }

    #[test]
    fn test_contended_lock_skips_command() {
        let store = Arc::new(RecordingStore::default());
        store.inner.try_acquire("sync").unwrap();
        let runner = CommandRunner::new(store.clone());
        let ran = Cell::new(false);
        let command = FnCommand::new("sync", || {
            ran.set(true);
            Ok(())
        });

        let (report, logs) = run_captured(&runner, &command, false);

        assert_eq!(
            report.outcome,
            RunOutcome::LockContended {
                name: "sync".to_string()
            }
        );
        assert!(!ran.get());
        assert_eq!(store.calls(), vec!["acquire:sync"]);
        assert!(store.is_held("sync").unwrap());
        assert_eq!(logs.count(Level::ERROR, "--skip-lock"), 1);
        assert_eq!(logs.count(Level::INFO, "Job took "), 1);
    }

    #[test]
    fn test_skip_lock_never_touches_store() {
        let store = Arc::new(RecordingStore::default());
        store.inner.try_acquire("sync").unwrap();
        let runner = CommandRunner::new(store.clone());
        let ran = Cell::new(false);
        let command = FnCommand::new("sync", || {
            ran.set(true);
            Ok(())
        });

        let report = runner.run(&command, true);

        assert!(report.outcome.is_success());
        assert!(ran.get());
        assert!(store.calls().is_empty());
        assert!(store.is_held("sync").unwrap());
    }

    #[test]
    fn test_skip_lock_failure_does_not_release() {
        let store = Arc::new(RecordingStore::default());
        let runner = CommandRunner::new(store.clone());
        let command = FnCommand::new("sync", || Err(CommandError::msg("nope")));

        let report = runner.run(&command, true);

        assert!(!report.outcome.is_success());
        assert!(store.calls().is_empty());
    }

    #[test]
    fn test_panic_is_captured() {
        let store = Arc::new(InMemoryLockStore::new());
        let runner = CommandRunner::new(store.clone());
        let command = FnCommand::new("explode", || panic!("out of cheese"));

        let (report, logs) = run_captured(&runner, &command, false);

        assert_eq!(
            report.outcome,
            RunOutcome::Failed {
                message: "out of cheese".to_string()
            }
        );
        assert_eq!(logs.count(Level::ERROR, "explode : System Crash"), 1);
        assert!(!store.is_held("explode").unwrap());
    }

    #[test]
    fn test_lock_store_error_is_failure() {
        let runner = CommandRunner::new(Arc::new(BrokenStore));
        let ran = Cell::new(false);
        let command = FnCommand::new("job", || {
            ran.set(true);
            Ok(())
        });

        let (report, logs) = run_captured(&runner, &command, false);

        assert!(matches!(report.outcome, RunOutcome::Failed { .. }));
        assert!(!ran.get());
        assert_eq!(logs.count(Level::ERROR, "denied"), 1);
    }

    #[test]
    fn test_finalization_order() {
        let runner = CommandRunner::new(Arc::new(InMemoryLockStore::new()));
        let command = FnCommand::new("job", || Ok(()));

        let (_, logs) = run_captured(&runner, &command, false);
        let messages: Vec<String> = logs
            .entries()
            .into_iter()
            .filter(|(level, _)| *level == Level::INFO)
            .map(|(_, m)| m)
            .collect();

        let prefixes = [
            "Job Started : ",
            "Memory at the beginning : ",
            SUCCESS_MESSAGE,
            "Memory at the end : ",
            "Peak memory : ",
            "Job Ended : ",
            "Job took ",
        ];
        assert_eq!(messages.len(), prefixes.len());
        for (message, prefix) in messages.iter().zip(prefixes) {
            assert!(message.starts_with(prefix), "{:?} vs {:?}", message, prefix);
        }
    }

    #[test]
    fn test_runner_is_reusable() {
        let runner = CommandRunner::new(Arc::new(InMemoryLockStore::new()));
        let command = FnCommand::new("job", || Ok(()));
        assert!(runner.run(&command, false).outcome.is_success());
        assert!(runner.run(&command, false).outcome.is_success());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunOutcome::Succeeded.exit_code(), 0);
        assert_eq!(
            RunOutcome::LockContended { name: "a".into() }.exit_code(),
            75
        );
        assert_eq!(
            RunOutcome::Failed {
                message: "x".into()
            }
            .exit_code(),
            1
        );
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "command panicked");
    }
}
