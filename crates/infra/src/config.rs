//! Engine configuration from the process environment.
//!
//! Every knob has a spec'd default except the database URL. Malformed
//! values fail startup instead of being silently defaulted.

use std::time::Duration;

use thiserror::Error;

use tallyd_core::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// Runtime configuration shared by the API and worker processes.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    /// Parallel worker loops per process.
    pub worker_concurrency: usize,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    /// Initial idle poll delay; also what a successful claim resets to.
    pub poll_interval: Duration,
    /// Ceiling for idle-poll doubling.
    pub idle_backoff_max: Duration,
    /// Age after which another worker may reclaim a locked job.
    pub stale_lock_timeout: Duration,
    pub run_migrations_on_startup: bool,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let poll_seconds: u64 = parse_var("WORKER_POLL_SECONDS", 1)?;
        let idle_backoff_max_seconds: u64 =
            parse_var("WORKER_IDLE_BACKOFF_MAX_SECONDS", poll_seconds)?;

        Ok(Self {
            database_url,
            worker_concurrency: parse_var("WORKER_CONCURRENCY", 2)?,
            max_attempts: parse_var("MAX_ATTEMPTS", 5)?,
            base_backoff: Duration::from_secs(parse_var("BASE_BACKOFF_SECONDS", 2)?),
            poll_interval: Duration::from_secs(poll_seconds),
            idle_backoff_max: Duration::from_secs(idle_backoff_max_seconds),
            stale_lock_timeout: Duration::from_secs(parse_var("STALE_LOCK_TIMEOUT_SECONDS", 300)?),
            run_migrations_on_startup: parse_bool("RUN_MIGRATIONS_ON_STARTUP", false)?,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.base_backoff)
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid { name, value: raw }),
        },
    }
}
