//! Configuration parsing and validation for the proxy server
//!
//! This module handles command-line argument parsing and validation using clap.
//! Aliases, providers and prices live in the JSON config file; everything here is process-wide.
use anyhow::anyhow;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tallyproxy::client::PoolSettings;
use tallyproxy::dispatcher::GlobalDefaults;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the proxy server will listen.
    #[arg(short = 'p', long, default_value_t = 4000)]
    pub port: u16,

    /// The address to bind to.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// The JSON file holding aliases, provider endpoints and prices.
    #[arg(short = 'c', long, default_value = "config.json")]
    pub config: PathBuf,

    /// The SQLite database the request ledger is written to. Created if missing.
    #[arg(long, default_value = "requests.db")]
    pub db: PathBuf,

    /// Default upstream timeout in seconds, used when neither the request nor the alias sets one.
    #[arg(short = 't', long, default_value_t = 120)]
    pub timeout: u64,

    /// Default number of retries for retryable upstream failures.
    #[arg(short = 'r', long, default_value_t = 3)]
    pub retries: u32,

    /// Whether we should continue watching the config file for changes
    #[arg(short = 'w', long, default_value_t = true, action = clap::ArgAction::Set)]
    pub watch: bool,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, default_value_t = true, action = clap::ArgAction::Set)]
    pub metrics: bool,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "tallyproxy")]
    pub metrics_prefix: String,

    /// Maximum number of idle HTTP connections to keep alive per upstream host.
    #[arg(long, default_value_t = 100)]
    pub pool_max_idle_per_host: usize,

    /// How long (in seconds) to keep idle HTTP connections alive.
    #[arg(long, default_value_t = 90)]
    pub pool_idle_timeout_secs: u64,
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if !self.config.exists() {
            return Err(anyhow!(
                "Config file '{}' does not exist",
                self.config.display()
            ));
        }
        if self.metrics && self.metrics_port == self.port {
            return Err(anyhow!(
                "Metrics port {} must differ from the proxy port",
                self.metrics_port
            ));
        }
        Ok(self)
    }

    pub fn defaults(&self) -> GlobalDefaults {
        GlobalDefaults {
            timeout_seconds: Some(self.timeout),
            max_retries: Some(self.retries),
        }
    }

    pub fn pool(&self) -> PoolSettings {
        PoolSettings {
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
            max_idle_per_host: self.pool_max_idle_per_host,
        }
    }
}
