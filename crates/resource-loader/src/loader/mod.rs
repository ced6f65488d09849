//! The deduplicating, concurrency-limited [`Loader`].
//!
//! Loading a key goes through three layers:
//!
//! 1. The in-memory cache of successful payloads. A hit returns right away.
//! 2. The in-flight [`Registry`]. If a fetch for the key is already running, the caller attaches
//!    to it and waits for its outcome.
//! 3. Otherwise the caller starts a new fetch, which waits for a slot in the [`AdmissionGate`]
//!    before invoking the [`Fetcher`].
//!
//! The fetch itself runs in a spawned task. Every caller waiting on it holds a [`WaiterGuard`],
//! and once the last of them is dropped before the fetch settled, the task is cancelled.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::FutureExt;
use futures::channel::oneshot;
use sentry::{Hub, SentryFutureExt};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{FetchError, InvalidCapacity, LoadError};
use crate::fetch::{FetchResult, Fetcher};
use crate::utils::futures::CallOnDrop;

mod gate;
mod registry;

pub use gate::{AdmissionGate, GatePermit};
use registry::{OutcomeChannel, PendingFetch, Registry, WaiterGuard};

/// The default number of registry shards for [`Loader::with_capacity`].
const DEFAULT_SHARDS: usize = 16;

type PayloadCache = moka::sync::Cache<Arc<str>, Bytes>;

/// A point in time snapshot of the [`Loader`] internals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStats {
    /// The number of payloads in the cache.
    pub cached_entries: u64,
    /// The total size of all cached payloads in bytes.
    pub cached_bytes: u64,
    /// The number of fetches that have not settled yet, including those waiting for a slot.
    pub pending_fetches: usize,
    /// The number of fetches currently holding a slot.
    pub active_fetches: usize,
    /// The number of free slots.
    pub available_slots: usize,
}

/// Loads byte payloads for keys, deduplicating and caching fetches.
///
/// The `Loader` is cheap to clone, all clones share the same cache and limits.
#[derive(Clone)]
pub struct Loader {
    inner: Arc<LoaderInner>,
}

struct LoaderInner {
    fetcher: Box<dyn Fetcher>,
    gate: AdmissionGate,
    /// Successful payloads, never evicted.
    ///
    /// Entries are only inserted while holding the registry shard lock of their key.
    cache: PayloadCache,
    registry: Arc<Registry>,
}

/// What a caller ends up with after looking at the cache and the registry.
enum Attach {
    Cached(Bytes),
    Waiting(OutcomeChannel, WaiterGuard),
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("capacity", &self.inner.gate.capacity())
            .field("cached entries", &self.inner.cache.entry_count())
            .field("pending fetches", &self.inner.registry.len())
            .finish()
    }
}

impl Loader {
    /// Creates a loader limited to the configured `max_concurrent_requests`.
    pub fn new(config: &Config, fetcher: impl Fetcher) -> Result<Self, InvalidCapacity> {
        Self::build(
            config.max_concurrent_requests,
            config.registry_shards,
            Box::new(fetcher),
        )
    }

    /// Creates a loader that runs at most `capacity` fetches at the same time.
    pub fn with_capacity(capacity: usize, fetcher: impl Fetcher) -> Result<Self, InvalidCapacity> {
        Self::build(capacity, DEFAULT_SHARDS, Box::new(fetcher))
    }

    fn build(
        capacity: usize,
        shards: usize,
        fetcher: Box<dyn Fetcher>,
    ) -> Result<Self, InvalidCapacity> {
        let gate = AdmissionGate::new(capacity)?;
        let cache = PayloadCache::builder()
            .name("loader")
            .weigher(|_k, v: &Bytes| u32::try_from(v.len()).unwrap_or(u32::MAX))
            .build();

        let inner = LoaderInner {
            fetcher,
            gate,
            cache,
            registry: Arc::new(Registry::new(shards)),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// The maximum number of fetches running at the same time.
    pub fn capacity(&self) -> usize {
        self.inner.gate.capacity()
    }

    /// Loads the payload for `key`.
    ///
    /// Returns the cached payload if there is one. Otherwise attaches to the running fetch for
    /// `key`, or starts a new one. Every caller attached to a fetch observes the same outcome.
    ///
    /// Dropping the returned future cancels this call. The fetch keeps running as long as at
    /// least one other caller waits on it.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Fetch`] if the fetch failed. Failures are not cached, the next call
    /// fetches again.
    pub async fn load(&self, key: &str) -> Result<Bytes, LoadError> {
        metric!(counter("loader.access") += 1);

        if let Some(payload) = self.inner.cache.get(key) {
            metric!(counter("loader.memory.hit") += 1);
            return Ok(payload);
        }

        let (outcome, _guard) = match self.attach(key) {
            Attach::Cached(payload) => return Ok(payload),
            Attach::Waiting(outcome, guard) => (outcome, guard),
        };

        let result = outcome.await.unwrap_or_else(|_canceled| {
            tracing::error!(key, "Fetch task went away without an outcome");
            Err(FetchError::InternalError)
        });
        Ok(result?)
    }

    /// Loads the payload for `key`, giving up once `cancel` is triggered.
    ///
    /// This is [`load`](Self::load) with an explicit cancellation signal, resolving to
    /// [`LoadError::Cancelled`] instead of just being dropped.
    pub async fn load_cancellable(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Bytes, LoadError> {
        tokio::select! {
            // a cache hit wins even against an already triggered token
            biased;
            result = self.load(key) => result,
            _ = cancel.cancelled() => {
                tracing::trace!(key, "Load cancelled by caller");
                Err(LoadError::Cancelled)
            }
        }
    }

    /// Returns a snapshot of the cache, registry and gate state.
    pub fn stats(&self) -> LoaderStats {
        let LoaderInner {
            gate,
            cache,
            registry,
            ..
        } = &*self.inner;

        cache.run_pending_tasks();
        LoaderStats {
            cached_entries: cache.entry_count(),
            cached_bytes: cache.weighted_size(),
            pending_fetches: registry.len(),
            active_fetches: gate.in_flight(),
            available_slots: gate.available(),
        }
    }

    /// Attaches to the pending fetch for `key`, or starts one.
    ///
    /// The cache is checked again under the registry lock, so callers never start a second fetch
    /// for a key that settled in the meantime, and never attach to a settled fetch.
    fn attach(&self, key: &str) -> Attach {
        let inner = &self.inner;
        let mut shard = inner.registry.lock(key);

        if let Some(payload) = inner.cache.get(key) {
            metric!(counter("loader.memory.hit") += 1);
            return Attach::Cached(payload);
        }

        if let Some(pending) = shard.get_mut(key) {
            // A concurrent load was deduplicated.
            metric!(counter("loader.channel.hit") += 1);
            pending.waiters += 1;
            tracing::trace!(key, waiters = pending.waiters, "Attached to pending fetch");

            let guard = WaiterGuard::new(
                Arc::clone(&inner.registry),
                Arc::from(key),
                pending.generation,
            );
            return Attach::Waiting(pending.outcome.clone(), guard);
        }

        metric!(counter("loader.channel.miss") += 1);
        let key: Arc<str> = Arc::from(key);
        let generation = inner.registry.next_generation();
        let cancel = CancellationToken::new();
        let outcome = self.spawn_fetch(Arc::clone(&key), generation, cancel.clone());
        tracing::trace!(key = &*key, generation, "Started new fetch");

        shard.insert(
            Arc::clone(&key),
            PendingFetch {
                generation,
                waiters: 1,
                outcome: outcome.clone(),
                cancel,
            },
        );
        let guard = WaiterGuard::new(Arc::clone(&inner.registry), key, generation);
        Attach::Waiting(outcome, guard)
    }

    /// Spawns the task driving the fetch of `key`.
    ///
    /// The task waits for a gate slot, fetches, populates the cache and finally sends the
    /// outcome to all attached callers. It stops early once `cancel` is triggered.
    ///
    /// NOTE: The registry entry for `generation` must be inserted by the caller while still
    /// holding the shard lock, otherwise the task could settle before the entry exists.
    fn spawn_fetch(
        &self,
        key: Arc<str>,
        generation: u64,
        cancel: CancellationToken,
    ) -> OutcomeChannel {
        let (sender, receiver) = oneshot::channel();
        let inner = Arc::clone(&self.inner);

        // Removes the entry if the task ends without settling, for instance due to a panic.
        let remove_token = {
            let registry = Arc::clone(&inner.registry);
            let key = Arc::clone(&key);
            CallOnDrop::new(move || {
                registry.remove(&key, generation);
            })
        };

        let task = async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(key = &*key, "Fetch aborted");
                }
                result = inner.fetch_and_settle(&key, generation) => {
                    // `fetch_and_settle` already removed the entry. Callers that observe the
                    // outcome will never find it in the registry again.
                    remove_token.disarm();
                    sender.send(result).ok();
                }
            }
        };

        tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));

        receiver.shared()
    }
}

impl LoaderInner {
    /// Fetches `key` once a gate slot is available, and settles the registry entry.
    ///
    /// On success, the payload is cached. The gate slot is released before returning.
    async fn fetch_and_settle(&self, key: &Arc<str>, generation: u64) -> FetchResult {
        let permit = match self.gate.acquire().await {
            Ok(permit) => permit,
            Err(err) => {
                self.settle(key, generation, &Err(err.clone()));
                return Err(err);
            }
        };
        metric!(gauge("loader.in_flight") = self.gate.in_flight() as u64);

        tracing::debug!(key = &**key, "Fetching");
        let start = Instant::now();
        let result = self.fetcher.fetch(key).await;

        metric!(
            timer("loader.fetch.duration") = start.elapsed(),
            "status" => if result.is_ok() { "ok" } else { "err" },
        );
        metric!(
            counter("loader.fetch") += 1,
            "status" => match &result {
                Ok(_) => "ok",
                Err(FetchError::NotFound) => "notfound",
                Err(FetchError::PermissionDenied(_)) => "permissiondenied",
                Err(FetchError::Timeout(_)) => "timeout",
                Err(FetchError::DownloadError(_)) => "downloaderror",
                Err(FetchError::InternalError) => "internalerror",
            },
        );
        if let Ok(payload) = &result {
            metric!(time_raw("loader.fetch.size") = payload.len() as u64);
        }

        self.settle(key, generation, &result);
        drop(permit);

        result
    }

    /// Removes the registry entry of `generation` and caches a successful payload.
    ///
    /// Nothing is cached if the entry is gone already, as the fetch was aborted in the meantime.
    fn settle(&self, key: &Arc<str>, generation: u64, result: &FetchResult) {
        let mut shard = self.registry.lock(key);
        if shard.remove(key, generation).is_none() {
            tracing::debug!(key = &**key, "Fetch settled after it was aborted");
            return;
        }

        match result {
            Ok(payload) => {
                self.cache.insert(Arc::clone(key), payload.clone());
            }
            Err(err) => {
                tracing::warn!(
                    key = &**key,
                    error = err as &dyn std::error::Error,
                    "Fetch failed"
                );
            }
        }
    }
}
