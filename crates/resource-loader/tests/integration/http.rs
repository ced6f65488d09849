use futures::future::join_all;
use resource_loader::config::HttpConfig;
use resource_loader::{FetchError, HttpFetcher, LoadError, Loader};

use crate::test;

fn http_loader(capacity: usize) -> Loader {
    let fetcher = HttpFetcher::new(&HttpConfig::default()).unwrap();
    Loader::with_capacity(capacity, fetcher).unwrap()
}

#[tokio::test]
async fn test_http_dedup_and_cache() {
    test::setup();
    let server = test::Server::new();
    let loader = http_loader(2);

    let url = server.url("delay/100ms/hello.txt");
    let results = join_all((0..5).map(|_| loader.load(url.as_str()))).await;
    for result in results {
        assert_eq!(&result.unwrap()[..], b"hello world\n");
    }
    assert_eq!(server.accesses("/delay/100ms/hello.txt"), 1);

    // served from memory from now on
    loader.load(url.as_str()).await.unwrap();
    assert_eq!(server.accesses("/delay/100ms/hello.txt"), 1);
    assert_eq!(server.accesses("/hello.txt"), 1);
}

#[tokio::test]
async fn test_http_errors_are_retried() {
    test::setup();
    let server = test::Server::new();
    let loader = http_loader(2);

    let url = server.url("i-do-not-exist");
    for _ in 0..2 {
        assert_eq!(
            loader.load(url.as_str()).await,
            Err(LoadError::Fetch(FetchError::NotFound))
        );
    }
    assert_eq!(server.accesses("/i-do-not-exist"), 2);

    let url = server.url("respond_statuscode/403");
    assert_eq!(
        loader.load(url.as_str()).await,
        Err(LoadError::Fetch(FetchError::PermissionDenied(
            "403 Forbidden".into()
        )))
    );
}

#[tokio::test]
async fn test_http_distinct_urls() {
    test::setup();
    let server = test::Server::new();
    let loader = http_loader(2);

    let urls: Vec<_> = (0..4).map(|i| server.url(&format!("echo/{i}"))).collect();
    let results = join_all(urls.iter().map(|url| loader.load(url.as_str()))).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), i.to_string());
    }
    assert_eq!(server.all_hits().len(), 4);
    assert_eq!(loader.stats().cached_entries, 4);
}
