//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use resource_loader::config::Config;
use resource_loader::{logging, metrics};

use crate::harness::{self, FetchMode, Workload};

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// The URL all callers load.
    #[arg(long, default_value = "https://example.com/resource")]
    url: String,

    /// The number of concurrent callers per round.
    #[arg(long, default_value_t = 5)]
    callers: usize,

    /// The number of distinct URLs the callers are spread over.
    ///
    /// Callers are assigned round robin to `url`, `url?d=1`, `url?d=2` and so on.
    #[arg(long, default_value_t = 1)]
    distinct: usize,

    /// Overrides the maximum number of concurrent fetches of the configuration file.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Cancels all outstanding callers of a round after this time, for instance `700ms`.
    #[arg(long, value_parser = humantime::parse_duration)]
    cancel_after: Option<Duration>,

    /// How often to repeat the batch of callers, later rounds are served from the cache.
    #[arg(long, default_value_t = 1)]
    rounds: usize,

    /// Fetch via HTTP instead of the simulated network.
    #[arg(long)]
    http: bool,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config()).context("failed loading config")?;
    if let Some(concurrency) = cli.concurrency {
        config.max_concurrent_requests = concurrency;
    }
    anyhow::ensure!(cli.distinct > 0, "`--distinct` must be at least 1");

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: The runtime is started below, there are no other threads yet.
    unsafe { logging::init_logging(&config, console::user_attended()) };

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )?;
    }

    let workload = Workload {
        url: cli.url,
        callers: cli.callers,
        distinct: cli.distinct,
        rounds: cli.rounds,
        cancel_after: cli.cancel_after,
    };
    let fetch = if cli.http {
        FetchMode::Http
    } else {
        FetchMode::Simulated
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create the runtime")?;
    runtime.block_on(harness::run(&config, &workload, fetch))
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_args() {
        let cli = Cli::try_parse_from([
            "loader-harness",
            "--callers",
            "10",
            "--distinct",
            "3",
            "--cancel-after",
            "700ms",
            "--http",
        ])
        .unwrap();

        assert_eq!(cli.callers, 10);
        assert_eq!(cli.distinct, 3);
        assert_eq!(cli.cancel_after, Some(Duration::from_millis(700)));
        assert_eq!(cli.rounds, 1);
        assert!(cli.http);
        assert!(cli.concurrency.is_none());
    }
}
