//! Configuration for the deploy daemon.
//!
//! Values come from `DEPLOYD_*` environment variables and an optional key=value
//! file. Precedence: environment > config file > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Prefix shared by all recognized environment variables.
pub const ENV_PREFIX: &str = "DEPLOYD_";

/// Job triggered when none is configured.
pub const DEFAULT_JOB_NAME: &str = "autodeploy";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("{key} must be at least 1 second")]
    ZeroInterval { key: String },
    #[error("{timeout_key} ({timeout}s) is shorter than {interval_key} ({interval}s)")]
    TimeoutBelowInterval {
        timeout_key: &'static str,
        timeout: u64,
        interval_key: &'static str,
        interval: u64,
    },
}

/// Credentials and endpoint of the CI system.
#[derive(Clone, PartialEq, Eq)]
pub struct CiCredentials {
    pub base_url: String,
    pub username: String,
    pub token: String,
}

impl std::fmt::Debug for CiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CiCredentials")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Daemon configuration.
#[derive(Clone)]
pub struct Config {
    // CI endpoint
    pub ci_url: Option<String>,
    pub ci_user: Option<String>,
    pub ci_token: Option<String>,
    pub ci_job_name: String,

    // Polling budgets
    pub queue_timeout_sec: u64,
    pub queue_interval_sec: u64,
    pub build_timeout_sec: u64,
    pub build_interval_sec: u64,

    // Request timeouts
    pub trigger_timeout_sec: u64,
    pub log_timeout_sec: u64,

    // Repository metadata (auto-deploy path)
    pub github_api: String,

    // Daemon
    pub db_path: Option<PathBuf>,
    pub listen_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ci_url: None,
            ci_user: None,
            ci_token: None,
            ci_job_name: DEFAULT_JOB_NAME.to_string(),
            queue_timeout_sec: 60,
            queue_interval_sec: 2,
            build_timeout_sec: 30 * 60,
            build_interval_sec: 5,
            trigger_timeout_sec: 10,
            log_timeout_sec: 10,
            github_api: "https://api.github.com".to_string(),
            db_path: None,
            listen_addr: "127.0.0.1:8000".to_string(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("ci_url", &self.ci_url)
            .field("ci_user", &self.ci_user)
            .field("ci_token", &self.ci_token.as_ref().map(|_| "<redacted>"))
            .field("ci_job_name", &self.ci_job_name)
            .field("queue_timeout_sec", &self.queue_timeout_sec)
            .field("queue_interval_sec", &self.queue_interval_sec)
            .field("build_timeout_sec", &self.build_timeout_sec)
            .field("build_interval_sec", &self.build_interval_sec)
            .field("trigger_timeout_sec", &self.trigger_timeout_sec)
            .field("log_timeout_sec", &self.log_timeout_sec)
            .field("github_api", &self.github_api)
            .field("db_path", &self.db_path)
            .field("listen_addr", &self.listen_addr)
            .finish()
    }
}

impl Config {
    /// Load config from defaults, an optional file, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = path {
            config.load_file(path)?;
        }
        config.apply_env(std::env::vars())?;
        config.validate_budgets()?;
        Ok(config)
    }

    /// Check that each polling loop waits between attempts and fits at least one interval.
    pub fn validate_budgets(&self) -> Result<(), ConfigError> {
        for (timeout_key, timeout, interval_key, interval) in [
            (
                "queue_timeout_sec",
                self.queue_timeout_sec,
                "queue_interval_sec",
                self.queue_interval_sec,
            ),
            (
                "build_timeout_sec",
                self.build_timeout_sec,
                "build_interval_sec",
                self.build_interval_sec,
            ),
        ] {
            if timeout < interval {
                return Err(ConfigError::TimeoutBelowInterval {
                    timeout_key,
                    timeout,
                    interval_key,
                    interval,
                });
            }
        }
        Ok(())
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Merge `DEPLOYD_*` variables; other variables are ignored.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            self.apply_value(&key.to_ascii_lowercase(), value.trim())?;
        }
        Ok(())
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let value = Self::unquote(value.trim());
            self.apply_value(key.trim(), &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "ci_url" => self.ci_url = Self::non_empty(value).map(|v| v.trim_end_matches('/').to_string()),
            "ci_user" => self.ci_user = Self::non_empty(value),
            "ci_token" => self.ci_token = Self::non_empty(value),
            "ci_job_name" => {
                if !value.is_empty() {
                    self.ci_job_name = value.to_string();
                }
            }
            "queue_timeout_sec" => self.queue_timeout_sec = Self::parse_int(key, value)?,
            "queue_interval_sec" => self.queue_interval_sec = Self::parse_interval(key, value)?,
            "build_timeout_sec" => self.build_timeout_sec = Self::parse_int(key, value)?,
            "build_interval_sec" => self.build_interval_sec = Self::parse_interval(key, value)?,
            "trigger_timeout_sec" => self.trigger_timeout_sec = Self::parse_int(key, value)?,
            "log_timeout_sec" => self.log_timeout_sec = Self::parse_int(key, value)?,
            "github_api" => self.github_api = value.trim_end_matches('/').to_string(),
            "db_path" => self.db_path = Self::non_empty(value).map(PathBuf::from),
            "listen_addr" => self.listen_addr = value.to_string(),
            _ => {
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn non_empty(value: &str) -> Option<String> {
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }

    fn parse_int(key: &str, value: &str) -> Result<u64, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_interval(key: &str, value: &str) -> Result<u64, ConfigError> {
        match Self::parse_int(key, value)? {
            0 => Err(ConfigError::ZeroInterval {
                key: key.to_string(),
            }),
            secs => Ok(secs),
        }
    }

    /// CI endpoint and credentials, or the first missing setting.
    pub fn ci_credentials(&self) -> Result<CiCredentials, ConfigError> {
        let base_url = self.ci_url.clone().ok_or(ConfigError::Missing("DEPLOYD_CI_URL"))?;
        let username = self.ci_user.clone().ok_or(ConfigError::Missing("DEPLOYD_CI_USER"))?;
        let token = self.ci_token.clone().ok_or(ConfigError::Missing("DEPLOYD_CI_TOKEN"))?;
        Ok(CiCredentials {
            base_url,
            username,
            token,
        })
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_sec)
    }

    pub fn queue_interval(&self) -> Duration {
        Duration::from_secs(self.queue_interval_sec)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_sec)
    }

    pub fn build_interval(&self) -> Duration {
        Duration::from_secs(self.build_interval_sec)
    }

    pub fn trigger_timeout(&self) -> Duration {
        Duration::from_secs(self.trigger_timeout_sec)
    }

    pub fn log_timeout(&self) -> Duration {
        Duration::from_secs(self.log_timeout_sec)
    }
}
