//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or a
//! numeric override doesn't parse. Sensitive values wrapped in
//! secrecy::SecretString to prevent log leaks.

pub mod jobs;

pub use jobs::{load_jobs_file, parse_jobs};

use crate::engine::{DispatchConfig, SchedulerConfig};
use crate::error::{Error, Result};
use secrecy::SecretString;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    /// SQLite URL for the job store and dead-letter store.
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub dispatch: DispatchConfig,
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        let mut dispatch = DispatchConfig::default();
        if let Some(n) = optional_var::<usize>("DISPATCH_WORKERS")? {
            dispatch.worker_count = n.max(1);
        }
        if let Some(n) = optional_var::<u32>("DISPATCH_MAX_ATTEMPTS")? {
            dispatch.default_max_attempts = n.max(1);
        }
        if let Some(secs) = optional_var::<u64>("DISPATCH_TIMEOUT_SECS")? {
            dispatch.default_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = optional_var::<u64>("DISPATCH_DEDUP_WINDOW_SECS")? {
            dispatch.dedup_window = Duration::from_secs(secs);
        }
        if let Some(capacity) = optional_var::<f64>("DISPATCH_RATE_CAPACITY")? {
            dispatch.rate_limit.capacity = capacity;
        }
        if let Some(rate) = optional_var::<f64>("DISPATCH_RATE_REFILL_PER_SEC")? {
            dispatch.rate_limit.refill_per_sec = rate;
        }

        let mut scheduler = SchedulerConfig::default();
        if let Some(secs) = optional_var::<u64>("DISPATCH_IDLE_POLL_SECS")? {
            scheduler.idle_poll = Duration::from_secs(secs.max(1));
        }
        scheduler.rate_limit_identity = std::env::var("DISPATCH_CRON_RATE_IDENTITY").ok();

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            dispatch,
            scheduler,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
