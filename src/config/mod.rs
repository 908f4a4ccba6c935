//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in `secrecy::SecretString` so it
//! never lands in logs.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::{Error, Result};

pub use secrecy::ExposeSecret;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Number of worker loops a serving process runs.
    pub workers: usize,
    /// Wait between polls of an empty queue.
    pub poll_interval: Duration,
    /// Stable name of this serving process; prefixes its worker ids.
    pub instance_id: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let workers = parsed_var("TASKQ_WORKERS", 2)?;
        if workers == 0 {
            return Err(Error::Config("TASKQ_WORKERS must be at least 1".to_string()));
        }
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            workers,
            poll_interval: Duration::from_millis(parsed_var("TASKQ_POLL_INTERVAL_MS", 2000)?),
            instance_id: std::env::var("TASKQ_INSTANCE_ID")
                .or_else(|_| std::env::var("HOSTNAME"))
                .unwrap_or_else(|_| "taskq".to_string()),
        })
    }

    /// Worker ids of this instance, `{instance_id}-{n}`.
    ///
    /// They are the same across restarts, so a restarting instance can find
    /// the claims its previous run left behind without touching the claims
    /// of other live instances.
    pub fn worker_ids(&self) -> Vec<String> {
        (0..self.workers)
            .map(|n| format!("{}-{n}", self.instance_id))
            .collect()
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid {name}={raw}: {e}"))),
        Err(_) => Ok(default),
    }
}
