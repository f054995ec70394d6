//! In-process lock store.

use super::{LockError, LockStore};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

/// Lock store backed by a shared set of held names.
///
/// Share one instance (behind an `Arc`) between runners that must exclude
/// each other. Locks are not visible to other processes.
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    held: Mutex<HashSet<String>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        // Poisoning is ignored; the set is never left half-updated.
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LockStore for InMemoryLockStore {
    fn try_acquire(&self, name: &str) -> Result<(), LockError> {
        if self.held().insert(name.to_string()) {
            Ok(())
        } else {
            Err(LockError::Contended {
                name: name.to_string(),
            })
        }
    }

    fn release(&self, name: &str) -> Result<(), LockError> {
        self.held().remove(name);
        Ok(())
    }

    fn is_held(&self, name: &str) -> Result<bool, LockError> {
        Ok(self.held().contains(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_and_release() {
        let store = InMemoryLockStore::new();
        store.try_acquire("a").unwrap();
        assert!(store.is_held("a").unwrap());
        store.release("a").unwrap();
        assert!(!store.is_held("a").unwrap());
        store.try_acquire("a").unwrap();
    }

    #[test]
    fn test_names_are_independent() {
        let store = InMemoryLockStore::new();
        store.try_acquire("a").unwrap();
        store.try_acquire("b").unwrap();
        assert!(store.try_acquire("a").is_err());
    }

    #[test]
    fn test_release_unheld_is_noop() {
        let store = InMemoryLockStore::new();
        store.release("never").unwrap();
        store.release("never").unwrap();
        assert!(!store.is_held("never").unwrap());
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let store = Arc::new(InMemoryLockStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.try_acquire("race").is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
