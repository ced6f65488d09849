//! The fetchers the [`Loader`](crate::Loader) delegates to.
//!
//! A [`Fetcher`] produces the payload for a single key. The loader takes care of deduplication,
//! caching and concurrency limits, so fetchers can be plain request/response implementations.

use std::future::Future;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::FetchError;

mod http;
mod simulated;

pub use http::HttpFetcher;
pub use simulated::SimulatedNetwork;

/// The outcome of a single fetch.
pub type FetchResult = Result<Bytes, FetchError>;

/// Fetches the payload of a key from its origin.
///
/// The returned future is dropped as soon as nobody is interested in the payload anymore, so
/// implementations should not do meaningful work outside of it.
pub trait Fetcher: Send + Sync + 'static {
    /// Fetches the payload for `key`.
    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, FetchResult>;
}

impl<F, Fut> Fetcher for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchResult> + Send + 'static,
{
    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, FetchResult> {
        Box::pin(self(key.to_owned()))
    }
}
