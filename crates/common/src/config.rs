use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable that overrides `gateway.base_url`.
pub const API_BASE_ENV: &str = "ANALYZER_API_BASE";

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub general: General,
    pub gateway: Gateway,
    pub poller: Poller,
    #[serde(default)]
    pub fallback: Fallback,
    pub insights: Option<Insights>,
    pub history: History,
    #[serde(default)]
    pub observability: Observability,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Gateway {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

impl Gateway {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Poller {
    pub interval_ms: u64,
    #[serde(default)]
    pub retry: RetryStrategy,
    /// Consecutive failed status checks before the snapshot carries a warning.
    pub surface_after_failures: u32,
}

/// How transient status-check failures are retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Retry on the regular poll interval forever.
    #[default]
    Fixed,
    /// Double the delay after each consecutive failure, capped at `max_delay_ms`.
    Exponential { max_delay_ms: u64 },
    /// Regular interval, give up after `max_attempts` consecutive failures.
    Bounded { max_attempts: u32 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Fallback {
    pub enabled: bool,
}

impl Default for Fallback {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Insights {
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct History {
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Observability {
    pub prometheus_port: Option<u16>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut config = Self::from_toml_str(&content)?;
        if let Ok(base) = std::env::var(API_BASE_ENV) {
            if !base.trim().is_empty() {
                config.gateway.base_url = base;
            }
        }
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.gateway.base_url.trim().is_empty(),
            "gateway.base_url must not be empty"
        );
        anyhow::ensure!(
            self.gateway.request_timeout_secs > 0,
            "gateway.request_timeout_secs must be > 0"
        );
        anyhow::ensure!(self.poller.interval_ms > 0, "poller.interval_ms must be > 0");
        match self.poller.retry {
            RetryStrategy::Fixed => {}
            RetryStrategy::Exponential { max_delay_ms } => anyhow::ensure!(
                max_delay_ms >= self.poller.interval_ms,
                "poller.retry.max_delay_ms must be >= poller.interval_ms"
            ),
            RetryStrategy::Bounded { max_attempts } => anyhow::ensure!(
                max_attempts > 0,
                "poller.retry.max_attempts must be > 0"
            ),
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_toml_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> &'static str {
        r#"
[general]
log_level = "info"

[gateway]
base_url = "http://localhost:8000"
request_timeout_secs = 15

[poller]
interval_ms = 1500
surface_after_failures = 5

[history]
path = "data/history.db"
"#
    }

    #[test]
    fn test_load_default_config() {
        let config =
            Config::from_toml_str(include_str!("../../../config/default.toml")).unwrap();
        assert_eq!(config.poller.interval_ms, 1500);
        assert_eq!(config.gateway.base_url, "http://localhost:8000");
        assert!(config.fallback.enabled);
        assert!(config.insights.is_some());
    }

    #[test]
    fn test_optional_sections_default() {
        let config = Config::from_toml_str(minimal()).unwrap();
        assert_eq!(config.poller.retry, RetryStrategy::Fixed);
        assert!(config.fallback.enabled);
        assert!(config.insights.is_none());
        assert_eq!(config.observability.prometheus_port, None);
        assert_eq!(config.general.log_format, LogFormat::Json);
    }

    #[test]
    fn test_parse_tagged_retry_strategies() {
        let toml = minimal().replace(
            "surface_after_failures = 5",
            "surface_after_failures = 5\nretry = { kind = \"exponential\", max_delay_ms = 30000 }",
        );
        let config = Config::from_toml_str(&toml).unwrap();
        assert_eq!(
            config.poller.retry,
            RetryStrategy::Exponential {
                max_delay_ms: 30_000
            }
        );

        let toml = minimal().replace(
            "surface_after_failures = 5",
            "surface_after_failures = 5\nretry = { kind = \"bounded\", max_attempts = 3 }",
        );
        let config = Config::from_toml_str(&toml).unwrap();
        assert_eq!(
            config.poller.retry,
            RetryStrategy::Bounded { max_attempts: 3 }
        );
    }

    #[test]
    fn test_rejects_zero_interval() {
        let toml = minimal().replace("interval_ms = 1500", "interval_ms = 0");
        let err = Config::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("poller.interval_ms"));
    }

    #[test]
    fn test_rejects_cap_below_interval() {
        let toml = minimal().replace(
            "surface_after_failures = 5",
            "surface_after_failures = 5\nretry = { kind = \"exponential\", max_delay_ms = 100 }",
        );
        assert!(Config::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analyzer.toml");
        std::fs::write(&path, minimal()).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.history.path, "data/history.db");
    }

    #[test]
    fn test_load_missing_file_names_path() {
        let err = Config::load("/nonexistent/analyzer.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/analyzer.toml"));
    }
}
