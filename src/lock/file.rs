//! Host-wide lock store backed by lock files.
//!
//! Each lock is a file `<dir>/<encoded-name>.lock`, created with exclusive
//! create semantics so only one process can hold a name at a time. The file
//! holds JSON metadata describing the holder.
//!
//! # File Names
//!
//! Lock names are percent-encoded into file stems. Lowercase ASCII letters,
//! digits, `.`, `_` and `-` are kept; every other byte (uppercase letters and
//! `%` included) becomes `%XX`. Distinct names therefore map to distinct files,
//! also on case-insensitive filesystems.
//!
//! # Stale Locks
//!
//! A lock file whose holder died without releasing is stale and is reclaimed on
//! the next acquire. On Linux a lock is stale when its recorded pid no longer
//! exists. Elsewhere process liveness is unknown: locks are only considered
//! stale once older than [`FileLockStore::with_stale_after`], and never when no
//! such limit is set.
//!
//! Reclaiming first renames the stale file to a path private to this process
//! and checks that it still holds the metadata judged stale. A concurrent
//! reclaimer can then never delete a lock somebody else has just taken.

use super::{LockError, LockStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const LOCK_EXTENSION: &str = "lock";

/// Metadata stored inside a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMetadata {
    /// Lock name as requested (before encoding).
    pub name: String,
    /// User that took the lock.
    pub owner: String,
    /// Process that holds the lock.
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LockMetadata {
    fn for_current_process(name: &str) -> Self {
        Self {
            name: name.to_string(),
            owner: current_user(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }

    /// Time since the lock was taken; zero if the clock went backwards.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.acquired_at).to_std().unwrap_or_default()
    }
}

/// Lock store keeping one file per lock name in a directory.
#[derive(Debug, Clone)]
pub struct FileLockStore {
    dir: PathBuf,
    stale_after: Option<Duration>,
}

impl FileLockStore {
    /// Use `dir` for lock files. The directory is created on first acquire.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            stale_after: None,
        }
    }

    /// Treat locks older than `limit` as stale when the holder's liveness
    /// cannot be checked (platforms other than Linux).
    pub fn with_stale_after(mut self, limit: Duration) -> Self {
        self.stale_after = Some(limit);
        self
    }

    /// `<temp_dir>/runlock`.
    pub fn default_dir() -> PathBuf {
        std::env::temp_dir().join("runlock")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the lock file for `name`.
    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", encode_name(name), LOCK_EXTENSION))
    }

    /// Read the metadata of a lock file, `None` if `name` has none.
    pub fn metadata(&self, name: &str) -> Result<Option<LockMetadata>, LockError> {
        read_metadata(&self.lock_path(name))
    }

    /// Whether the holder recorded in `metadata` is known to be gone.
    pub fn is_stale(&self, metadata: &LockMetadata) -> bool {
        stale_verdict(pid_alive(metadata.pid), metadata.age(), self.stale_after)
    }

    /// All lock files in the directory, sorted by name. Stale locks are included.
    ///
    /// Files that cannot be parsed are skipped with a warning.
    pub fn list(&self) -> Result<Vec<LockMetadata>, LockError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(LockError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut locks = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| LockError::Io {
                    path: self.dir.clone(),
                    source,
                })?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOCK_EXTENSION) {
                continue;
            }
            match read_metadata(&path) {
                Ok(Some(metadata)) => locks.push(metadata),
                Ok(None) => {}
                Err(e) => warn!("skipping unreadable lock file: {}", e),
            }
        }

        locks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(locks)
    }

    /// Remove the lock file for `name` regardless of holder.
    ///
    /// Returns `true` if a lock file was removed.
    pub fn clear(&self, name: &str) -> Result<bool, LockError> {
        remove_lock_file(&self.lock_path(name))
    }

    fn create_lock_file(&self, path: &Path, name: &str) -> Result<bool, LockError> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(source) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let metadata = LockMetadata::for_current_process(name);
        let json = serde_json::to_vec_pretty(&metadata).map_err(|source| LockError::Metadata {
            path: path.to_path_buf(),
            source,
        })?;

        if let Err(source) = file.write_all(&json).and_then(|()| file.sync_all()) {
            // Do not leave a half-written lock behind.
            let _ = fs::remove_file(path);
            return Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            });
        }

        Ok(true)
    }

    /// Metadata of the lock file at `path` if it is stale.
    fn stale_holder(&self, path: &Path) -> Option<LockMetadata> {
        match read_metadata(path) {
            Ok(Some(metadata)) if self.is_stale(&metadata) => Some(metadata),
            // Live, being written by its holder, unreadable, or already gone.
            _ => None,
        }
    }

    /// Take over the lock file at `path`, previously read as the stale `seen`.
    ///
    /// Returns `false` when another process got there first.
    fn reclaim(&self, path: &Path, name: &str, seen: &LockMetadata) -> Result<bool, LockError> {
        let claim = claim_path(path);
        match fs::rename(path, &claim) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(source) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }

        match read_metadata(&claim) {
            Ok(Some(claimed)) if claimed == *seen => {}
            _ => {
                // A new holder took the lock between the stale check and the rename.
                restore_claim(&claim, path, name);
                return Ok(false);
            }
        }

        warn!(lock = %name, stale_pid = seen.pid, path = %path.display(), "reclaiming stale lock");
        remove_lock_file(&claim)?;
        self.create_lock_file(path, name)
    }
}

impl Default for FileLockStore {
    fn default() -> Self {
        Self::new(Self::default_dir())
    }
}

impl LockStore for FileLockStore {
    fn try_acquire(&self, name: &str) -> Result<(), LockError> {
        fs::create_dir_all(&self.dir).map_err(|source| LockError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.lock_path(name);
        if self.create_lock_file(&path, name)? {
            return Ok(());
        }

        if let Some(seen) = self.stale_holder(&path)
            && self.reclaim(&path, name, &seen)?
        {
            return Ok(());
        }

        Err(LockError::Contended {
            name: name.to_string(),
        })
    }

    fn release(&self, name: &str) -> Result<(), LockError> {
        let path = self.lock_path(name);
        match read_metadata(&path)? {
            Some(metadata) if metadata.pid == std::process::id() => {
                remove_lock_file(&path)?;
            }
            Some(metadata) => {
                debug!(
                    lock = %name,
                    holder_pid = metadata.pid,
                    "not releasing lock held by another process"
                );
            }
            None => {}
        }
        Ok(())
    }

    /// A stale lock file does not count as held.
    fn is_held(&self, name: &str) -> Result<bool, LockError> {
        let path = self.lock_path(name);
        match read_metadata(&path) {
            Ok(Some(metadata)) => Ok(!self.is_stale(&metadata)),
            Ok(None) => Ok(path.exists()),
            // Unparseable files still block acquisition.
            Err(LockError::Metadata { .. }) => Ok(true),
            Err(e) => Err(e),
        }
    }
}

/// Percent-encodes a lock name into a file stem.
fn encode_name(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_lowercase() || byte.is_ascii_digit() || matches!(byte, b'.' | b'_' | b'-')
        {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

/// `<lock file>.reclaim-<pid>`, private to this process.
fn claim_path(path: &Path) -> PathBuf {
    let mut file_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(OsString::new);
    file_name.push(format!(".reclaim-{}", std::process::id()));
    path.with_file_name(file_name)
}

/// Move a wrongly claimed lock file back to `path` without clobbering a newer one.
fn restore_claim(claim: &Path, path: &Path, name: &str) {
    match fs::hard_link(claim, path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            warn!(lock = %name, "lock was taken again while restoring it; dropping claimed file");
        }
        Err(_) => {
            if let Err(e) = fs::rename(claim, path) {
                warn!(lock = %name, "failed to restore lock file: {}", e);
            }
            return;
        }
    }
    if let Err(e) = fs::remove_file(claim) {
        warn!(lock = %name, path = %claim.display(), "failed to remove claim file: {}", e);
    }
}

/// `alive` is `None` when liveness cannot be checked on this platform.
fn stale_verdict(alive: Option<bool>, age: Duration, stale_after: Option<Duration>) -> bool {
    match alive {
        Some(alive) => !alive,
        None => stale_after.is_some_and(|limit| age > limit),
    }
}

/// `Ok(None)` when the file does not exist or is still empty.
fn read_metadata(path: &Path) -> Result<Option<LockMetadata>, LockError> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    if contents.is_empty() {
        return Ok(None);
    }

    serde_json::from_slice(&contents)
        .map(Some)
        .map_err(|source| LockError::Metadata {
            path: path.to_path_buf(),
            source,
        })
}

fn remove_lock_file(path: &Path) -> Result<bool, LockError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(source) => Err(LockError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> Option<bool> {
    Some(Path::new("/proc").join(pid.to_string()).exists())
}

#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> Option<bool> {
    None
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
