//! Environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::replay::ReplayPolicy;

pub const DEFAULT_API_URL: &str = "http://localhost:8080";
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: '{value}' ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Settings of the offline pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineConfig {
    /// `TRADEFLOW_API_URL`
    pub api_url: String,
    /// `TRADEFLOW_AUTH_TOKEN`
    pub auth_token: Option<String>,
    /// `TRADEFLOW_QUEUE_DB`; `None` uses the per-user data directory.
    pub queue_db: Option<PathBuf>,
    /// `TRADEFLOW_PROBE_INTERVAL_SECS`
    pub probe_interval: Duration,
    /// `TRADEFLOW_REQUEST_TIMEOUT_SECS`
    pub request_timeout: Duration,
    /// `TRADEFLOW_MAX_ATTEMPTS` and `TRADEFLOW_MAX_AGE_HOURS`
    pub replay_policy: ReplayPolicy,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            auth_token: None,
            queue_db: None,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            replay_policy: ReplayPolicy::default(),
        }
    }
}

impl OfflineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let mut replay_policy = ReplayPolicy::default();
        if let Some(max) = positive("TRADEFLOW_MAX_ATTEMPTS", get("TRADEFLOW_MAX_ATTEMPTS"))? {
            replay_policy = replay_policy.with_max_attempts(max);
        }
        if let Some(hours) = positive("TRADEFLOW_MAX_AGE_HOURS", get("TRADEFLOW_MAX_AGE_HOURS"))? {
            replay_policy = replay_policy.with_max_age(Duration::from_secs(u64::from(hours) * 3600));
        }

        Ok(Self {
            api_url: get("TRADEFLOW_API_URL").unwrap_or(defaults.api_url),
            auth_token: get("TRADEFLOW_AUTH_TOKEN"),
            queue_db: get("TRADEFLOW_QUEUE_DB").map(PathBuf::from),
            probe_interval: positive(
                "TRADEFLOW_PROBE_INTERVAL_SECS",
                get("TRADEFLOW_PROBE_INTERVAL_SECS"),
            )?
            .map(|s| Duration::from_secs(u64::from(s)))
            .unwrap_or(defaults.probe_interval),
            request_timeout: positive(
                "TRADEFLOW_REQUEST_TIMEOUT_SECS",
                get("TRADEFLOW_REQUEST_TIMEOUT_SECS"),
            )?
            .map(|s| Duration::from_secs(u64::from(s)))
            .unwrap_or(defaults.request_timeout),
            replay_policy,
        })
    }
}

fn positive(name: &'static str, raw: Option<String>) -> Result<Option<u32>, ConfigError> {
    let Some(value) = raw else {
        return Ok(None);
    };
    match value.parse::<u32>() {
        Ok(0) => Err(ConfigError::Invalid {
            name,
            value,
            reason: "must be greater than zero",
        }),
        Ok(n) => Ok(Some(n)),
        Err(_) => Err(ConfigError::Invalid {
            name,
            value,
            reason: "expected a positive integer",
        }),
    }
}
