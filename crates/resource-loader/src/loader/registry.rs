use std::collections::HashMap;
use std::hash::{BuildHasher, RandomState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::channel::oneshot;
use futures::future::Shared;
use tokio_util::sync::CancellationToken;

use crate::fetch::FetchResult;

/// The channel every caller attached to a fetch receives the outcome from.
pub type OutcomeChannel = Shared<oneshot::Receiver<FetchResult>>;

/// A fetch that has not settled yet.
#[derive(Debug)]
pub struct PendingFetch {
    /// Distinguishes this fetch from earlier and later fetches of the same key.
    pub generation: u64,
    /// The number of attached callers that did not cancel yet.
    pub waiters: usize,
    pub outcome: OutcomeChannel,
    /// Stops the fetch once every caller went away.
    pub cancel: CancellationToken,
}

/// One independently locked part of the [`Registry`].
#[derive(Debug, Default)]
pub struct Shard {
    pending: HashMap<Arc<str>, PendingFetch>,
}

impl Shard {
    pub fn get_mut(&mut self, key: &str) -> Option<&mut PendingFetch> {
        self.pending.get_mut(key)
    }

    pub fn insert(&mut self, key: Arc<str>, pending: PendingFetch) {
        let evicted = self.pending.insert(key, pending);
        debug_assert!(evicted.is_none());
    }

    /// Removes the entry for `key`, but only if it still belongs to `generation`.
    pub fn remove(&mut self, key: &str, generation: u64) -> Option<PendingFetch> {
        match self.pending.get(key) {
            Some(pending) if pending.generation == generation => self.pending.remove(key),
            _ => None,
        }
    }
}

/// The in-flight registry, mapping keys to their pending fetch.
///
/// The registry is split into shards by key hash, each behind its own lock, so that callers for
/// unrelated keys rarely contend with each other.
#[derive(Debug)]
pub struct Registry {
    shards: Box<[Mutex<Shard>]>,
    hasher: RandomState,
    generations: AtomicU64,
}

impl Registry {
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1)).map(|_| Mutex::default()).collect();
        Self {
            shards,
            hasher: RandomState::new(),
            generations: AtomicU64::new(0),
        }
    }

    /// Locks the shard responsible for `key`.
    pub fn lock(&self, key: &str) -> MutexGuard<'_, Shard> {
        let index = self.hasher.hash_one(key) as usize % self.shards.len();
        // a panic while holding the lock can not leave a shard half-updated
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    /// Removes the entry for `key` if it still belongs to `generation`.
    pub fn remove(&self, key: &str, generation: u64) -> Option<PendingFetch> {
        self.lock(key).remove(key, generation)
    }

    /// Detaches a single caller from the fetch of `generation`.
    ///
    /// When the last caller detaches before the fetch settled, the fetch is cancelled and removed,
    /// so the next caller starts a fresh one.
    pub fn detach(&self, key: &str, generation: u64) {
        let mut shard = self.lock(key);
        let Some(pending) = shard.get_mut(key) else {
            return;
        };
        if pending.generation != generation {
            return;
        }

        pending.waiters -= 1;
        tracing::trace!(key, waiters = pending.waiters, "Caller detached from fetch");
        if pending.waiters > 0 {
            return;
        }

        if let Some(pending) = shard.remove(key, generation) {
            pending.cancel.cancel();
            metric!(counter("loader.fetch.aborted") += 1);
            tracing::debug!(key, "Every caller went away, aborting fetch");
        }
    }

    /// The number of fetches that have not settled yet.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).pending.len())
            .sum()
    }
}

/// Keeps a caller attached to a pending fetch, and detaches it when dropped.
///
/// Dropping the guard after the fetch settled is a no-op.
#[derive(Debug)]
pub struct WaiterGuard {
    registry: Arc<Registry>,
    key: Arc<str>,
    generation: u64,
}

impl WaiterGuard {
    /// Creates a guard for a caller that was already counted in `waiters`.
    pub fn new(registry: Arc<Registry>, key: Arc<str>, generation: u64) -> Self {
        Self {
            registry,
            key,
            generation,
        }
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.registry.detach(&self.key, self.generation);
    }
}
