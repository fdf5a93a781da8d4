//! Pipeline configuration as a fixed record.
//!
//! The recognized options below are the complete set; there is no dynamic
//! configuration anywhere else in the system. Values come from the
//! environment; the daemon loads `.env.local` first as a dev convenience.

use std::time::Duration;

use anyhow::{Context, Result};

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_INGEST_PORT: &str = "INGEST_PORT";
pub const ENV_BATCH_SIZE: &str = "BATCH_SIZE";
pub const ENV_POLL_INTERVAL_MS: &str = "POLL_INTERVAL_MS";
pub const ENV_WORKER_CONCURRENCY: &str = "WORKER_CONCURRENCY";

pub const DEFAULT_INGEST_PORT: u16 = 8188;
pub const DEFAULT_BATCH_SIZE: i64 = 100;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_WORKER_CONCURRENCY: usize = 2;

/// Complete runtime configuration for the ingest daemon and its workers.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string. Required.
    pub database_url: String,
    /// TCP port the ingest HTTP server binds on.
    pub ingest_port: u16,
    /// Max events per claim. Larger = more throughput, more lock holding.
    pub batch_size: i64,
    /// Idle sleep when the queue is empty.
    pub poll_interval: Duration,
    /// Number of parallel claim/project drivers in this process.
    pub worker_concurrency: usize,
}

impl Config {
    /// Read the full record from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source (tests inject maps here).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = lookup(ENV_DATABASE_URL)
            .with_context(|| format!("missing env var {ENV_DATABASE_URL}"))?;

        let ingest_port = parse_or(&lookup, ENV_INGEST_PORT, DEFAULT_INGEST_PORT)?;
        let batch_size: i64 = parse_or(&lookup, ENV_BATCH_SIZE, DEFAULT_BATCH_SIZE)?;
        let poll_interval_ms: u64 =
            parse_or(&lookup, ENV_POLL_INTERVAL_MS, DEFAULT_POLL_INTERVAL_MS)?;
        let worker_concurrency: usize =
            parse_or(&lookup, ENV_WORKER_CONCURRENCY, DEFAULT_WORKER_CONCURRENCY)?;

        if batch_size <= 0 {
            anyhow::bail!("{ENV_BATCH_SIZE} must be > 0, got {batch_size}");
        }
        if worker_concurrency == 0 {
            anyhow::bail!("{ENV_WORKER_CONCURRENCY} must be > 0");
        }

        Ok(Self {
            database_url,
            ingest_port,
            batch_size,
            poll_interval: Duration::from_millis(poll_interval_ms),
            worker_concurrency,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid value for {name}: '{raw}'")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
