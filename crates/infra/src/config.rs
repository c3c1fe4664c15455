//! Process configuration from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::jobs::BackoffPolicy;
use crate::sync::{HttpApiConfig, DEFAULT_PAGE_SIZE};
use crate::workers::WorkerConfig;

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const POLL_INTERVAL_SECS: &str = "JOBSYNC_POLL_INTERVAL_SECS";
pub const HEARTBEAT_SECS: &str = "JOBSYNC_HEARTBEAT_SECS";
pub const INFRA_BACKOFF_SECS: &str = "JOBSYNC_INFRA_BACKOFF_SECS";
pub const BACKOFF_BASE_MS: &str = "JOBSYNC_BACKOFF_BASE_MS";
pub const BACKOFF_MAX_MS: &str = "JOBSYNC_BACKOFF_MAX_MS";
pub const MAX_CONNECTIONS: &str = "JOBSYNC_MAX_CONNECTIONS";
pub const API_BASE_URL: &str = "JOBSYNC_API_BASE_URL";
pub const API_TOKEN: &str = "JOBSYNC_API_TOKEN";
pub const SYNC_PAGE_SIZE: &str = "JOBSYNC_SYNC_PAGE_SIZE";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings shared by every `jobsync` command.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub database_url: String,
    pub max_connections: u32,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub infra_backoff: Duration,
    pub backoff: BackoffPolicy,
    pub api_base_url: Option<String>,
    pub api_token: Option<String>,
    pub sync_page_size: u32,
}

impl QueueSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build settings from an arbitrary variable source. Empty values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let database_url = get(DATABASE_URL).ok_or(ConfigError::Missing(DATABASE_URL))?;
        let worker = WorkerConfig::default();
        let default_backoff = BackoffPolicy::default();

        let poll_secs: u64 = parse_or(&get, POLL_INTERVAL_SECS, worker.poll_interval.as_secs())?;
        let heartbeat_secs: u64 =
            parse_or(&get, HEARTBEAT_SECS, worker.heartbeat_interval.as_secs())?;
        if heartbeat_secs == 0 {
            return Err(invalid(HEARTBEAT_SECS, "0", "must be at least 1"));
        }
        let infra_secs: u64 = parse_or(&get, INFRA_BACKOFF_SECS, worker.infra_backoff.as_secs())?;
        let base_ms: u64 = parse_or(
            &get,
            BACKOFF_BASE_MS,
            default_backoff.base.as_millis() as u64,
        )?;
        let max_ms: u64 = parse_or(&get, BACKOFF_MAX_MS, default_backoff.max.as_millis() as u64)?;
        if max_ms < base_ms {
            return Err(invalid(
                BACKOFF_MAX_MS,
                &max_ms.to_string(),
                &format!("must not be below {BACKOFF_BASE_MS} ({base_ms})"),
            ));
        }
        let max_connections: u32 = parse_or(&get, MAX_CONNECTIONS, 5)?;
        if max_connections == 0 {
            return Err(invalid(MAX_CONNECTIONS, "0", "must be at least 1"));
        }
        let sync_page_size: u32 = parse_or(&get, SYNC_PAGE_SIZE, DEFAULT_PAGE_SIZE)?;
        if sync_page_size == 0 {
            return Err(invalid(SYNC_PAGE_SIZE, "0", "must be at least 1"));
        }

        Ok(Self {
            database_url,
            max_connections,
            poll_interval: Duration::from_secs(poll_secs),
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            infra_backoff: Duration::from_secs(infra_secs),
            backoff: BackoffPolicy::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms)),
            api_base_url: get(API_BASE_URL),
            api_token: get(API_TOKEN),
            sync_page_size,
        })
    }

    /// Worker configuration seeded from these settings.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_poll_interval(self.poll_interval)
            .with_heartbeat_interval(self.heartbeat_interval)
            .with_infra_backoff(self.infra_backoff)
            .with_backoff(self.backoff)
    }

    /// HTTP client configuration, if an API base URL is configured.
    pub fn api_config(&self) -> Result<HttpApiConfig, ConfigError> {
        let base_url = self
            .api_base_url
            .clone()
            .ok_or(ConfigError::Missing(API_BASE_URL))?;
        let config = HttpApiConfig::new(base_url);
        Ok(match &self.api_token {
            Some(token) => config.with_token(token.clone()),
            None => config,
        })
    }
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(var, &raw, &e.to_string())),
        None => Ok(default),
    }
}

fn invalid(var: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
