use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use rand::Rng;

use super::{FetchResult, Fetcher};
use crate::config::SimulatedNetworkConfig;
use crate::error::FetchError;

/// A fake network with random latency and a payload derived from the key.
///
/// Every fetch sleeps for a random duration within the configured latency range and then
/// returns `bytes(<key>)`. Optionally, fetches fail randomly with a
/// [`DownloadError`](FetchError::DownloadError).
#[derive(Clone, Debug, Default)]
pub struct SimulatedNetwork {
    config: SimulatedNetworkConfig,
}

impl SimulatedNetwork {
    pub fn new(config: SimulatedNetworkConfig) -> Self {
        Self { config }
    }

    /// The payload the simulated network serves for `key`.
    pub fn payload(key: &str) -> Bytes {
        Bytes::from(format!("bytes({key})"))
    }

    /// Rolls the latency and the success of the next fetch.
    fn roll(&self) -> (Duration, bool) {
        let SimulatedNetworkConfig {
            min_latency,
            max_latency,
            failure_rate,
        } = self.config;

        let mut rng = rand::rng();
        let latency = if max_latency > min_latency {
            rng.random_range(min_latency..max_latency)
        } else {
            min_latency
        };
        let fails = rng.random_bool(failure_rate.clamp(0.0, 1.0));

        (latency, fails)
    }
}

impl Fetcher for SimulatedNetwork {
    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, FetchResult> {
        let (latency, fails) = self.roll();

        Box::pin(async move {
            tracing::trace!(key, ?latency, "Simulating network request");
            tokio::time::sleep(latency).await;

            if fails {
                return Err(FetchError::DownloadError(format!(
                    "simulated network failure for `{key}`"
                )));
            }
            Ok(Self::payload(key))
        })
    }
}
