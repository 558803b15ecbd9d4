//! Environment-driven configuration, read once at startup.

use anyhow::{anyhow, bail, Result};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of restarts before the proxy gives up on the child.
    pub restart_limit: u32,
    /// Delay between an observed crash and the automatic restart attempt.
    pub restart_delay: Duration,
    /// Whether an unexpected child exit triggers an automatic restart.
    pub auto_restart: bool,
    /// Deadline for every forwarded request.
    pub request_timeout: Duration,
    /// How long a stopping child gets before the kill escalation.
    pub graceful_timeout: Duration,
}

fn default_restart_limit() -> u32 {
    3
}

fn default_restart_delay_ms() -> u64 {
    1000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_graceful_timeout_ms() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            restart_limit: default_restart_limit(),
            restart_delay: Duration::from_millis(default_restart_delay_ms()),
            auto_restart: true,
            request_timeout: Duration::from_millis(default_request_timeout_ms()),
            graceful_timeout: Duration::from_millis(default_graceful_timeout_ms()),
        }
    }
}

impl Config {
    /// Loads configuration from `MCPGUARD_*` environment variables,
    /// falling back to the defaults above for anything unset.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            restart_limit: env_var("MCPGUARD_RESTART_LIMIT")?.unwrap_or_else(default_restart_limit),
            restart_delay: Duration::from_millis(
                env_var("MCPGUARD_RESTART_DELAY_MS")?.unwrap_or_else(default_restart_delay_ms),
            ),
            auto_restart: env_bool("MCPGUARD_AUTO_RESTART")?.unwrap_or(true),
            request_timeout: Duration::from_millis(
                env_var("MCPGUARD_REQUEST_TIMEOUT_MS")?.unwrap_or_else(default_request_timeout_ms),
            ),
            graceful_timeout: Duration::from_millis(
                env_var("MCPGUARD_GRACEFUL_TIMEOUT_MS")?.unwrap_or_else(default_graceful_timeout_ms),
            ),
        };

        if config.request_timeout.is_zero() {
            bail!("MCPGUARD_REQUEST_TIMEOUT_MS must be greater than zero");
        }

        Ok(config)
    }
}

fn env_var<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("invalid {key}={raw}: {e}")),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(anyhow!("cannot read {key}: {e}")),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim() {
            "1" | "true" | "yes" => Ok(Some(true)),
            "0" | "false" | "no" => Ok(Some(false)),
            other => Err(anyhow!("invalid {key}={other}: expected a boolean")),
        },
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(anyhow!("cannot read {key}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment variables are process-global, so defaults and overrides
    // are exercised in one sequential test.
    #[test]
    fn from_env_defaults_and_overrides() {
        for key in [
            "MCPGUARD_RESTART_LIMIT",
            "MCPGUARD_RESTART_DELAY_MS",
            "MCPGUARD_AUTO_RESTART",
            "MCPGUARD_REQUEST_TIMEOUT_MS",
            "MCPGUARD_GRACEFUL_TIMEOUT_MS",
        ] {
            std::env::remove_var(key);
        }

        let config = Config::from_env().unwrap();
        assert_eq!(config.restart_limit, 3);
        assert!(config.auto_restart);
        assert_eq!(config.request_timeout, Duration::from_millis(30_000));

        std::env::set_var("MCPGUARD_RESTART_LIMIT", "7");
        std::env::set_var("MCPGUARD_AUTO_RESTART", "false");
        std::env::set_var("MCPGUARD_REQUEST_TIMEOUT_MS", "100");
        let config = Config::from_env().unwrap();
        assert_eq!(config.restart_limit, 7);
        assert!(!config.auto_restart);
        assert_eq!(config.request_timeout, Duration::from_millis(100));

        std::env::set_var("MCPGUARD_RESTART_LIMIT", "not-a-number");
        assert!(Config::from_env().is_err());

        std::env::set_var("MCPGUARD_RESTART_LIMIT", "7");
        std::env::set_var("MCPGUARD_REQUEST_TIMEOUT_MS", "0");
        assert!(Config::from_env().is_err());

        for key in [
            "MCPGUARD_RESTART_LIMIT",
            "MCPGUARD_AUTO_RESTART",
            "MCPGUARD_REQUEST_TIMEOUT_MS",
        ] {
            std::env::remove_var(key);
        }
    }
}
