//! Fixed-size pools of striped mutexes.
//!
//! A key hashes onto one of N stripes. Unrelated keys may share a stripe;
//! memory stays bounded regardless of key count.

use blobnode_common::Fingerprint;
use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};

/// Pool of mutexes indexed by key hash
pub struct StripedLock {
    stripes: Vec<Mutex<()>>,
    hasher: RandomState,
}

impl StripedLock {
    /// Create a pool with `count` stripes (at least one)
    pub fn new(count: usize) -> Self {
        Self {
            stripes: (0..count.max(1)).map(|_| Mutex::new(())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn index(&self, key: &Fingerprint) -> usize {
        let mut h = self.hasher.build_hasher();
        key.hash(&mut h);
        (h.finish() % self.stripes.len() as u64) as usize
    }

    /// Lock the stripe of one key
    pub fn lock(&self, key: &Fingerprint) -> MutexGuard<'_, ()> {
        self.stripes[self.index(key)].lock()
    }

    /// Lock the stripes of several keys in ascending stripe order
    ///
    /// Keys sharing a stripe lock it once, so callers never self-deadlock.
    pub fn lock_many<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a Fingerprint>,
    ) -> Vec<MutexGuard<'_, ()>> {
        let mut indices: Vec<usize> = keys.into_iter().map(|k| self.index(k)).collect();
        indices.sort_unstable();
        indices.dedup();
        indices.into_iter().map(|i| self.stripes[i].lock()).collect()
    }

    /// Number of stripes
    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }
}
