//! Exposes the command line application.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use verdict_cache::metrics;

use crate::config::Config;
use crate::healthcheck;
use crate::logging;
use crate::server;

/// Verdict commands.
#[derive(Subcommand)]
enum Command {
    /// Run the web server.
    Run {
        /// Serve plain HTTP only, even if HTTPS is configured.
        #[arg(long, short)]
        local: bool,
    },

    /// Check whether a running server is healthy.
    Healthcheck {
        /// Address of the server, defaults to the configured `bind` address.
        #[arg(long)]
        addr: Option<SocketAddr>,

        /// Request timeout in seconds.
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

/// Classification service for remote resources.
#[derive(Parser)]
#[command(version, about, bin_name = "verdict")]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
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
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: we are still single-threaded at this point, no runtime has been started yet.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();

        if let Some(hostname_tag) = config.metrics.hostname_tag.clone() {
            if tags.contains_key(&hostname_tag) {
                tracing::warn!(
                    "tag {} defined both as hostname tag and as a custom tag",
                    hostname_tag
                );
            }
            if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(hostname_tag, hostname);
            } else {
                tracing::error!("could not read host name");
            }
        }

        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)?;
    }

    match cli.command {
        Command::Run { local } => server::run(config, local).context("failed to start the server")?,
        Command::Healthcheck { addr, timeout } => healthcheck::healthcheck(config, addr, timeout)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["verdict", "-c", "verdict.yml", "run", "--local"]).unwrap();
        assert_eq!(cli.config(), Some(Path::new("verdict.yml")));
        assert!(matches!(cli.command, Command::Run { local: true }));

        let cli = Cli::try_parse_from(["verdict", "run"]).unwrap();
        assert!(cli.config().is_none());
        assert!(matches!(cli.command, Command::Run { local: false }));
    }

    #[test]
    fn test_parse_healthcheck() {
        let cli = Cli::try_parse_from([
            "verdict",
            "healthcheck",
            "--addr",
            "127.0.0.1:8000",
            "--config",
            "verdict.yml",
        ])
        .unwrap();
        assert!(cli.config().is_some());
        match cli.command {
            Command::Healthcheck { addr, timeout } => {
                assert_eq!(addr, Some("127.0.0.1:8000".parse().unwrap()));
                assert_eq!(timeout, 5);
            }
            Command::Run { .. } => panic!("expected healthcheck"),
        }
    }

    #[test]
    fn test_command_required() {
        assert!(Cli::try_parse_from(["verdict"]).is_err());
    }
}
