//! Loader harness.
//!
//! Fires batches of concurrent callers at a [`resource_loader::Loader`] and reports what each of
//! them observed, to watch deduplication, the concurrency limit, caching and cancellation at work.

#![warn(clippy::all)]

mod cli;
mod harness;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            resource_loader::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
