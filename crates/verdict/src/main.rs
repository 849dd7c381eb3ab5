//! Verdict.
//!
//! Verdict is a web service that downloads a remote resource, has a model server score it, and
//! derives a verdict from the scores. Classifications are cached per locator, and concurrent
//! requests for the same locator share a single download and model call.

#![warn(missing_debug_implementations, clippy::all)]

mod classifier;
mod cli;
mod config;
mod download;
mod endpoints;
mod healthcheck;
mod logging;
mod server;
mod service;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
