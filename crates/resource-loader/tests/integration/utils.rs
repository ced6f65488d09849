use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use resource_loader::config::SimulatedNetworkConfig;
use resource_loader::{FetchResult, Fetcher, Loader, SimulatedNetwork};
use tokio::time::Instant;

pub use loader_test as test;

/// A single fetch as seen by a [`RecordingFetcher`].
#[derive(Debug, Clone)]
pub struct FetchRecord {
    pub key: String,
    pub start: Instant,
    /// When the fetch completed, or `None` if it was aborted.
    pub end: Option<Instant>,
}

impl FetchRecord {
    /// Whether this fetch ran at the same time as `other`.
    pub fn overlaps(&self, other: &FetchRecord) -> bool {
        let self_end = self.end.unwrap_or_else(Instant::now);
        let other_end = other.end.unwrap_or_else(Instant::now);
        self.start < other_end && other.start < self_end
    }
}

/// Wraps a [`Fetcher`] and records every fetch it performs.
pub struct RecordingFetcher<F> {
    inner: Arc<F>,
    records: Arc<Mutex<Vec<FetchRecord>>>,
}

impl<F> Clone for RecordingFetcher<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            records: Arc::clone(&self.records),
        }
    }
}

impl<F: Fetcher> RecordingFetcher<F> {
    pub fn new(inner: F) -> Self {
        Self {
            inner: Arc::new(inner),
            records: Default::default(),
        }
    }

    pub fn records(&self) -> Vec<FetchRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// The number of fetches that were dropped before they completed.
    pub fn aborted(&self) -> usize {
        let records = self.records.lock().unwrap();
        records.iter().filter(|record| record.end.is_none()).count()
    }
}

impl<F: Fetcher> Fetcher for RecordingFetcher<F> {
    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, FetchResult> {
        Box::pin(async move {
            let index = {
                let mut records = self.records.lock().unwrap();
                records.push(FetchRecord {
                    key: key.to_owned(),
                    start: Instant::now(),
                    end: None,
                });
                records.len() - 1
            };

            let result = self.inner.fetch(key).await;

            self.records.lock().unwrap()[index].end = Some(Instant::now());
            result
        })
    }
}

/// A simulated network that always takes `latency` and never fails.
pub fn fixed_network(latency: Duration) -> SimulatedNetwork {
    SimulatedNetwork::new(SimulatedNetworkConfig {
        min_latency: latency,
        max_latency: latency,
        failure_rate: 0.0,
    })
}

/// Setup tests and create a loader with the given capacity on top of the default simulated
/// network.
///
/// Returns the loader together with the fetcher, which records all fetches the loader made.
pub fn setup_loader(capacity: usize) -> (Loader, RecordingFetcher<SimulatedNetwork>) {
    test::setup();

    let fetcher = RecordingFetcher::new(SimulatedNetwork::new(Default::default()));
    let loader = Loader::with_capacity(capacity, fetcher.clone()).unwrap();
    (loader, fetcher)
}
