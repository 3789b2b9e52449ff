//! In-flight reservation store
//!
//! Tracks content hashes that have been published but have not yet reached a
//! terminal delivery state. State is process-lifetime only.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::hash::ContentHash;

/// Concurrent set of reserved content hashes
///
/// Cloning yields another handle to the same set. The lock is only held for
/// the duration of a single set operation.
#[derive(Clone, Default)]
pub struct HashStore {
    inner: Arc<Mutex<HashSet<ContentHash>>>,
}

impl HashStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a hash. Returns `false` if it is already in flight.
    pub fn reserve(&self, hash: &ContentHash) -> bool {
        let inserted = self.inner.lock().insert(hash.clone());
        tracing::trace!(hash = %hash.short(), inserted, "reserve");
        inserted
    }

    /// Release a reservation. Returns whether it was held.
    pub fn release(&self, hash: &ContentHash) -> bool {
        let removed = self.inner.lock().remove(hash);
        tracing::trace!(hash = %hash.short(), removed, "release");
        removed
    }

    /// Advisory membership check; only `reserve` is authoritative.
    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.inner.lock().contains(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_twice_fails() {
        let store = HashStore::new();
        let hash = ContentHash::compute(b"payload");

        assert!(store.reserve(&hash));
        assert!(!store.reserve(&hash));
        assert!(store.contains(&hash));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_release_allows_reserve_again() {
        let store = HashStore::new();
        let hash = ContentHash::compute(b"payload");

        assert!(store.reserve(&hash));
        assert!(store.release(&hash));
        assert!(!store.release(&hash));
        assert!(store.is_empty());
        assert!(store.reserve(&hash));
    }

    #[test]
    fn test_clones_share_state() {
        let store = HashStore::new();
        let other = store.clone();
        let hash = ContentHash::compute(b"shared");

        assert!(store.reserve(&hash));
        assert!(!other.reserve(&hash));
        assert!(other.release(&hash));
        assert!(!store.contains(&hash));
    }

    #[test]
    fn test_concurrent_reserve_single_winner() {
        let store = HashStore::new();
        let hash = ContentHash::compute(b"race");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                let hash = hash.clone();
                std::thread::spawn(move || store.reserve(&hash))
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
