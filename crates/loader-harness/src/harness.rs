use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::future::join_all;
use resource_loader::config::Config;
use resource_loader::{HttpFetcher, LoadError, Loader, SimulatedNetwork};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio_util::sync::CancellationToken;

/// Which fetcher backs the loader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchMode {
    Simulated,
    Http,
}

/// A batch of callers, repeated for a number of rounds.
#[derive(Clone, Debug)]
pub struct Workload {
    pub url: String,
    pub callers: usize,
    pub distinct: usize,
    pub rounds: usize,
    pub cancel_after: Option<Duration>,
}

/// What a single caller observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Success,
    Error,
    Cancelled,
}

/// Totals of a single round.
#[derive(Default)]
pub struct RoundSummary {
    pub successes: usize,
    pub errors: usize,
    pub cancelled: usize,
    pub elapsed: Duration,
    /// Time from request to response per caller, in seconds.
    pub latencies: DDSketch,
}

impl RoundSummary {
    fn record(&mut self, outcome: Outcome, latency: Duration) {
        match outcome {
            Outcome::Success => self.successes += 1,
            Outcome::Error => self.errors += 1,
            Outcome::Cancelled => self.cancelled += 1,
        }
        self.latencies.add(latency.as_secs_f64());
    }

    fn quantile(&self, q: f64) -> Duration {
        let secs = self.latencies.quantile(q).ok().flatten().unwrap_or_default();
        Duration::from_secs_f64(secs)
    }
}

/// The keys callers are assigned to, round robin.
///
/// The first key is `url` itself, the others append a `d=<i>` query parameter, joined with `&`
/// if `url` already has a query.
pub fn keys(url: &str, distinct: usize) -> Vec<String> {
    let separator = if url.contains('?') { '&' } else { '?' };
    (0..distinct.max(1))
        .map(|i| match i {
            0 => url.to_owned(),
            i => format!("{url}{separator}d={i}"),
        })
        .collect()
}

pub async fn run(config: &Config, workload: &Workload, fetch: FetchMode) -> Result<()> {
    let loader = match fetch {
        FetchMode::Simulated => {
            Loader::new(config, SimulatedNetwork::new(config.simulated_network))
        }
        FetchMode::Http => {
            let fetcher =
                HttpFetcher::new(&config.http).context("failed to create the HTTP client")?;
            Loader::new(config, fetcher)
        }
    }
    .context("invalid loader configuration")?;
    tracing::info!(capacity = loader.capacity(), ?fetch, "Loader ready");

    let keys = keys(&workload.url, workload.distinct);
    let mut next_id = 1;

    for round in 1..=workload.rounds {
        let summary = run_round(&loader, &keys, workload, &mut next_id).await;
        print_summary(round, &summary);
    }

    tracing::info!(stats = ?loader.stats(), "All rounds finished");
    Ok(())
}

/// Runs one batch of callers until all of them responded or got cancelled.
///
/// Caller ids continue from `next_id`, so they are unique across rounds.
pub async fn run_round(
    loader: &Loader,
    keys: &[String],
    workload: &Workload,
    next_id: &mut usize,
) -> RoundSummary {
    let cancel_all = CancellationToken::new();
    let start = Instant::now();

    let mut callers = Vec::with_capacity(workload.callers);
    for (id, key) in (*next_id..).zip(keys.iter().cycle()).take(workload.callers) {
        let loader = loader.clone();
        let key = key.clone();
        let cancel = cancel_all.child_token();

        let caller = async move {
            tracing::info!("Request: #{id} → load({key})");
            let start = Instant::now();
            let outcome = match loader.load_cancellable(&key, &cancel).await {
                Ok(payload) => {
                    tracing::info!("Response: #{id} → success: {} bytes", payload.len());
                    Outcome::Success
                }
                Err(LoadError::Cancelled) => {
                    tracing::info!("Response: #{id} → cancelled");
                    Outcome::Cancelled
                }
                Err(err) => {
                    tracing::info!("Response: #{id} → error: {err}");
                    Outcome::Error
                }
            };
            (outcome, start.elapsed())
        };
        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
        callers.push(tokio::spawn(caller.bind_hub(hub)));
    }
    *next_id += workload.callers;

    let canceller = workload.cancel_after.map(|after| {
        let cancel_all = cancel_all.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            tracing::info!("Cancel all");
            cancel_all.cancel();
        })
    });

    let mut summary = RoundSummary::default();
    for result in join_all(callers).await {
        match result {
            Ok((outcome, latency)) => summary.record(outcome, latency),
            Err(err) => {
                tracing::error!(error = &err as &dyn std::error::Error, "Caller panicked");
                summary.errors += 1;
            }
        }
    }
    if let Some(canceller) = canceller {
        canceller.abort();
    }

    summary.elapsed = start.elapsed();
    summary
}

fn print_summary(round: usize, summary: &RoundSummary) {
    let RoundSummary {
        successes,
        errors,
        cancelled,
        elapsed,
        ..
    } = summary;
    println!(
        "Round {round}: {successes} succeeded, {errors} failed, {cancelled} cancelled in {elapsed:.2?}"
    );

    let p50 = summary.quantile(0.5);
    let p90 = summary.quantile(0.9);
    let p99 = summary.quantile(0.99);
    println!("  p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
}

#[cfg(test)]
mod tests {
    use resource_loader::config::SimulatedNetworkConfig;

    use super::*;

    fn workload(callers: usize, distinct: usize, cancel_after: Option<Duration>) -> Workload {
        Workload {
            url: "https://example.com/resource".into(),
            callers,
            distinct,
            rounds: 1,
            cancel_after,
        }
    }

    fn loader(capacity: usize) -> Loader {
        let network = SimulatedNetwork::new(SimulatedNetworkConfig {
            min_latency: Duration::from_millis(500),
            max_latency: Duration::from_millis(500),
            failure_rate: 0.0,
        });
        Loader::with_capacity(capacity, network).unwrap()
    }

    #[test]
    fn test_keys() {
        assert_eq!(keys("url", 1), ["url"]);
        assert_eq!(keys("url", 3), ["url", "url?d=1", "url?d=2"]);
        assert_eq!(keys("url?x=y", 2), ["url?x=y", "url?x=y&d=1"]);
        assert_eq!(keys("url", 0), ["url"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_round() {
        let loader = loader(2);
        let workload = workload(6, 3, None);
        let keys = keys(&workload.url, workload.distinct);
        let mut next_id = 1;

        let summary = run_round(&loader, &keys, &workload, &mut next_id).await;
        assert_eq!(summary.successes, 6);
        assert_eq!(summary.errors + summary.cancelled, 0);
        assert_eq!(summary.latencies.count(), 6);
        assert_eq!(next_id, 7);
        assert_eq!(loader.stats().cached_entries, 3);

        // everything is cached now
        let summary = run_round(&loader, &keys, &workload, &mut next_id).await;
        assert_eq!(summary.successes, 6);
        assert_eq!(next_id, 13);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let loader = loader(2);
        let workload = workload(4, 2, Some(Duration::from_millis(100)));
        let keys = keys(&workload.url, workload.distinct);

        let summary = run_round(&loader, &keys, &workload, &mut 1).await;
        assert_eq!(summary.cancelled, 4);
        assert_eq!(summary.successes, 0);

        tokio::time::sleep(Duration::from_millis(1)).await;
        let stats = loader.stats();
        assert_eq!(stats.pending_fetches, 0);
        assert_eq!(stats.available_slots, 2);
        assert_eq!(stats.cached_entries, 0);
    }
}
