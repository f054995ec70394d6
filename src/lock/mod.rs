//! Named locks.
//!
//! A lock store grants exclusive ownership of a name. Acquisition is a single
//! immediate attempt: a held name fails with [`LockError::Contended`] rather
//! than blocking.
//!
//! Two stores are provided:
//!
//! - [`InMemoryLockStore`]: names held in a shared set, scoped to the process
//! - [`FileLockStore`]: one lock file per name in a directory, scoped to the host
//!
//! # RAII Guards
//!
//! [`LockGuard`] releases its name when dropped. A release failure during drop
//! is logged at warn level and otherwise ignored.

mod file;
mod memory;

pub use file::{FileLockStore, LockMetadata};
pub use memory::InMemoryLockStore;

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors returned by lock stores.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another holder owns the lock.
    #[error("lock '{name}' is already held")]
    Contended { name: String },

    /// Lock file could not be created, read, or removed.
    #[error("lock file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Lock file metadata could not be encoded or decoded.
    #[error("lock metadata in '{path}': {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Storage for named locks.
pub trait LockStore: Send + Sync {
    /// Take the lock for `name`, failing with [`LockError::Contended`] if held.
    fn try_acquire(&self, name: &str) -> Result<(), LockError>;

    /// Give up the lock for `name`. Releasing a name that is not held is a no-op.
    fn release(&self, name: &str) -> Result<(), LockError>;

    /// Whether `name` is currently held.
    fn is_held(&self, name: &str) -> Result<bool, LockError>;
}

/// Exclusive ownership of a lock name, released on drop.
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    name: String,
    released: bool,
}

impl LockGuard {
    /// Acquire `name` from `store`.
    pub fn acquire(store: Arc<dyn LockStore>, name: impl Into<String>) -> Result<Self, LockError> {
        let name = name.into();
        store.try_acquire(&name)?;
        debug!(lock = %name, "lock acquired");
        Ok(Self {
            store,
            name,
            released: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release now, reporting any store error.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        let result = self.store.release(&self.name);
        if result.is_ok() {
            debug!(lock = %self.name, "lock released");
        }
        result
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match self.store.release(&self.name) {
            Ok(()) => debug!(lock = %self.name, "lock released"),
            Err(e) => warn!(lock = %self.name, "failed to release lock: {}", e),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("released", &self.released)
            .finish()
    }
}
