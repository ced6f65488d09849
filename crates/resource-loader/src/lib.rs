//! A concurrent, deduplicating resource loader.
//!
//! The [`Loader`] serves byte payloads for string keys (usually URLs) to any number of concurrent
//! callers. Concurrent requests for the same key share one underlying fetch, the number of fetches
//! running at the same time is bounded, successful payloads are kept in memory, and a fetch is
//! aborted once every caller waiting on it went away.
//!
//! The actual fetching is done by a [`Fetcher`], such as the [`SimulatedNetwork`] or the
//! [`HttpFetcher`].

#[macro_use]
pub mod metrics;

pub mod config;
pub mod error;
pub mod fetch;
pub mod loader;
pub mod logging;
pub mod utils;

pub use error::{FetchError, InvalidCapacity, LoadError};
pub use fetch::{FetchResult, Fetcher, HttpFetcher, SimulatedNetwork};
pub use loader::{Loader, LoaderStats};
