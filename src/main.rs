//! runlock - run a command inside a locked, instrumented envelope.
//!
//! Usage:
//!   runlock exec [--skip-lock] [--name NAME] -- <program> [args...]
//!   runlock locks                List held lock files
//!   runlock unlock <NAME>        Remove a lock file

mod cli_config;

use clap::{Parser, Subcommand};
use cli_config::Config;
use runlock::core::duration::format_compact;
use runlock::{CommandRunner, FileLockStore, LockStore, ProcessCommand};
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// runlock - locked, instrumented execution of command-line jobs
#[derive(Parser)]
#[command(name = "runlock")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (overrides XDG default)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Lock file directory (overrides config file)
    #[arg(long, global = true, env = "RUNLOCK_DIR")]
    lock_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program as a locked command
    Exec {
        /// Command identity used for logging and as the lock name
        /// (default: the program's file name)
        #[arg(short, long)]
        name: Option<String>,

        /// Skip the lock if specifically requested
        #[arg(short = 's', long, visible_alias = "sl")]
        skip_lock: bool,

        /// Exit non-zero when the lock is held (75) or the program fails (1)
        #[arg(long)]
        strict: bool,

        /// Program to run, followed by its arguments
        #[arg(
            value_name = "PROGRAM",
            required = true,
            trailing_var_arg = true,
            allow_hyphen_values = true
        )]
        program: Vec<OsString>,
    },

    /// List lock files currently held
    Locks,

    /// Remove a lock file, e.g. one left behind on another host
    Unlock {
        /// Lock name
        #[arg(value_name = "NAME")]
        name: String,
    },
}

fn init_logging(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let loaded = Config::load(cli.config.as_deref());
    init_logging(
        loaded
            .as_ref()
            .map(|c| c.logging.filter.as_str())
            .unwrap_or("info"),
    );

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let store = config.lock.file_store(cli.lock_dir);

    match cli.command {
        Commands::Exec {
            name,
            skip_lock,
            strict,
            program,
        } => {
            let code = exec(Arc::new(store), name, skip_lock, program);
            if strict && code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Locks => {
            list_locks(&store)?;
        }
        Commands::Unlock { name } => {
            unlock(&store, &name)?;
        }
    }

    Ok(())
}

/// Run a program inside the envelope, returning the outcome's exit code.
fn exec(
    store: Arc<dyn LockStore>,
    name: Option<String>,
    skip_lock: bool,
    program: Vec<OsString>,
) -> i32 {
    let mut argv = program.into_iter();
    // clap guarantees at least one value
    let Some(program) = argv.next() else {
        return 0;
    };

    let mut command = ProcessCommand::new(program).args(argv);
    if let Some(name) = name {
        command = command.with_name(name);
    }

    let runner = CommandRunner::new(store);
    runner.run(&command, skip_lock).outcome.exit_code()
}

/// List lock files in the lock directory.
fn list_locks(store: &FileLockStore) -> Result<(), Box<dyn std::error::Error>> {
    let locks = store.list()?;

    if locks.is_empty() {
        println!("No lock files in {}", store.dir().display());
        return Ok(());
    }

    println!("Locks in {}:", store.dir().display());
    println!();

    for lock in &locks {
        let status = if store.is_stale(lock) { "stale" } else { "held" };
        println!("{}", lock.name);
        println!("  Status: {}", status);
        println!("  Owner: {}", lock.owner);
        println!("  PID: {}", lock.pid);
        println!(
            "  Acquired: {} ({} ago)",
            lock.acquired_at.to_rfc3339(),
            format_compact(lock.age())
        );
    }

    Ok(())
}

/// Remove the lock file for `name`.
fn unlock(store: &FileLockStore, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(metadata) = store.metadata(name)? {
        info!(
            "Removing lock '{}' held by {} (pid {})",
            name, metadata.owner, metadata.pid
        );
    }

    if store.clear(name)? {
        info!("Lock '{}' removed", name);
    } else {
        warn!("Lock '{}' is not held", name);
    }

    Ok(())
}
