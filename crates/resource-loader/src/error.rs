use std::time::Duration;

use thiserror::Error;

/// An error that happens when fetching a resource from its origin.
///
/// A `FetchError` is shared between every caller attached to the failed fetch, so it is cheap to
/// clone and carries only owned, printable details. It is never cached.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The resource was not found at its origin.
    #[error("not found")]
    NotFound,
    /// The resource could not be fetched due to missing permissions.
    ///
    /// The attached string contains the origin's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The resource could not be fetched in time.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The resource could not be fetched due to another problem,
    /// like connection loss, DNS resolution, or a 5xx server response.
    ///
    /// The attached string contains the origin's response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// An unexpected error in the loader itself.
    #[error("internal error")]
    InternalError,
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        tracing::debug!(error = &err as &dyn std::error::Error, "Request failed");
        Self::DownloadError(err.to_string())
    }
}

/// The outcome of a single [`Loader::load`](crate::Loader::load) call that did not produce a
/// payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The underlying fetch failed.
    ///
    /// Every caller attached to the fetch observes the same error.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// The caller gave up before an outcome was available.
    ///
    /// This only ever concerns the cancelling caller, other callers waiting on the same fetch
    /// are not affected.
    #[error("cancelled")]
    Cancelled,
}

impl LoadError {
    /// Returns `true` if the load was cancelled by its caller.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A [`Loader`](crate::Loader) was configured to allow no concurrent fetches at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("the loader needs to allow at least one concurrent request")]
pub struct InvalidCapacity;
