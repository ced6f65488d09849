use std::time::Duration;

use futures::future::join_all;
use resource_loader::{LoadError, Loader, SimulatedNetwork};
use tokio_util::sync::CancellationToken;

use crate::{RecordingFetcher, fixed_network, setup_loader, test};

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_one_fetch() {
    let (loader, fetcher) = setup_loader(2);

    let results = join_all((0..5).map(|_| loader.load("A"))).await;

    assert_eq!(fetcher.calls(), 1);
    let expected = SimulatedNetwork::payload("A");
    for result in results {
        let payload = result.unwrap();
        assert_eq!(payload.len(), expected.len());
        assert_eq!(payload, expected);
    }
}

#[tokio::test(start_paused = true)]
async fn test_single_slot_serializes_fetches() {
    let (loader, fetcher) = setup_loader(1);

    let (a, b) = tokio::join!(loader.load("A"), loader.load("B"));
    assert_eq!(a.unwrap(), SimulatedNetwork::payload("A"));
    assert_eq!(b.unwrap(), SimulatedNetwork::payload("B"));

    let records = fetcher.records();
    assert_eq!(records.len(), 2);
    assert!(!records[0].overlaps(&records[1]), "{records:#?}");
}

#[tokio::test(start_paused = true)]
async fn test_bounded_overlap() {
    test::setup();
    let fetcher = RecordingFetcher::new(fixed_network(Duration::from_millis(100)));
    let loader = Loader::with_capacity(3, fetcher.clone()).unwrap();

    let keys: Vec<_> = (0..12).map(|i| format!("url?d={i}")).collect();
    let results = join_all(keys.iter().map(|key| loader.load(key))).await;
    assert!(results.iter().all(Result::is_ok));

    let records = fetcher.records();
    assert_eq!(records.len(), 12);
    for record in &records {
        let overlapping = records
            .iter()
            .filter(|other| record.overlaps(other))
            .count();
        // `overlapping` includes the record itself
        assert!(overlapping <= 3, "{} overlaps with too many", record.key);
    }
}

#[tokio::test(start_paused = true)]
async fn test_fetch_survives_partial_cancellation() {
    let (loader, fetcher) = setup_loader(2);

    let tokens: Vec<_> = (0..3).map(|_| CancellationToken::new()).collect();
    let handles: Vec<_> = tokens
        .iter()
        .map(|token| {
            let loader = loader.clone();
            let token = token.clone();
            tokio::spawn(async move { loader.load_cancellable("A", &token).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(1)).await;
    tokens[0].cancel();
    tokens[1].cancel();

    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(results[0], Err(LoadError::Cancelled));
    assert_eq!(results[1], Err(LoadError::Cancelled));
    assert_eq!(results[2], Ok(SimulatedNetwork::payload("A")));

    assert_eq!(fetcher.calls(), 1);
    assert_eq!(fetcher.aborted(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_aborted_when_everyone_cancels() {
    let (loader, fetcher) = setup_loader(2);

    let token = CancellationToken::new();
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let loader = loader.clone();
            let token = token.clone();
            tokio::spawn(async move { loader.load_cancellable("A", &token).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(1)).await;
    token.cancel();
    for handle in handles {
        assert_eq!(handle.await.unwrap(), Err(LoadError::Cancelled));
    }

    // give the fetch task a chance to observe the abort
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(fetcher.aborted(), 1);

    let stats = loader.stats();
    assert_eq!(stats.pending_fetches, 0);
    assert_eq!(stats.available_slots, 2);
    assert_eq!(stats.cached_entries, 0);

    assert_eq!(loader.load("A").await, Ok(SimulatedNetwork::payload("A")));
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(fetcher.aborted(), 1);
}
