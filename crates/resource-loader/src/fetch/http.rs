//! Support to fetch resources from HTTP origins.

use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::{Client, StatusCode, Url};

use super::{FetchResult, Fetcher};
use crate::config::HttpConfig;
use crate::error::FetchError;

/// Fetcher implementation that treats keys as URLs and downloads them via HTTP `GET`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: &HttpConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().user_agent(&config.user_agent).build()?;
        Ok(Self::with_client(client, config.timeout))
    }

    pub fn with_client(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Downloads the resource behind `key`, bounded by the configured timeout.
    async fn download(&self, key: &str) -> FetchResult {
        let url = Url::parse(key).map_err(|_| FetchError::NotFound)?;

        tracing::debug!("Fetching resource from `{}`", url);

        match tokio::time::timeout(self.timeout, self.send_request(url)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(self.timeout)),
        }
    }

    async fn send_request(&self, url: Url) -> FetchResult {
        let response = self.client.get(url).send().await?;
        let status = response.status();

        if status.is_success() {
            tracing::trace!("Success hitting `{}`", response.url());
            let payload: Bytes = response.bytes().await?;
            return Ok(payload);
        }

        tracing::trace!(
            "Unexpected status code from `{}`: {}",
            response.url(),
            status
        );
        match status {
            StatusCode::NOT_FOUND => Err(FetchError::NotFound),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(FetchError::PermissionDenied(status.to_string()))
            }
            _ => Err(FetchError::DownloadError(status.to_string())),
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, FetchResult> {
        Box::pin(self.download(key))
    }
}
