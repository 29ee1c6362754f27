//! Harness configuration.
//!
//! Key=value config file format with defaults. Unknown keys and malformed
//! values are typed errors so a bad config is caught before any tool runs.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Engine configuration for one harness run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Directory the per-test-case report files are written under.
    pub report_dir: PathBuf,
    /// Name recorded as responsible tester on every run.
    pub tester_in_charge: String,
    /// Budget for one timed log search.
    pub message_search_timeout_sec: u64,
    /// Tick of the search poll loop.
    pub poll_interval_ms: u64,
    /// Grace period between the stop request and the hard kill.
    pub stop_grace_period_ms: u64,
    /// Upper bound on teardown log collection before force-stopping.
    pub teardown_guard_sec: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            report_dir: PathBuf::from("reports"),
            tester_in_charge: "unknown".to_string(),
            message_search_timeout_sec: 30,
            poll_interval_ms: 100,
            stop_grace_period_ms: 5000,
            teardown_guard_sec: 60,
        }
    }
}

impl HarnessConfig {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
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

            let key = key.trim();
            let value = Self::unquote(value.trim());
            self.apply_value(key, &value)?;
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
            "report_dir" => self.report_dir = PathBuf::from(value),
            "tester_in_charge" => self.tester_in_charge = value.to_string(),
            "message_search_timeout_sec" => {
                self.message_search_timeout_sec = Self::parse_int(key, value)?;
            }
            "poll_interval_ms" => self.poll_interval_ms = Self::parse_int(key, value)?,
            "stop_grace_period_ms" => self.stop_grace_period_ms = Self::parse_int(key, value)?,
            "teardown_guard_sec" => self.teardown_guard_sec = Self::parse_int(key, value)?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    fn parse_int(key: &str, value: &str) -> Result<u64, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    pub fn message_search_timeout(&self) -> Duration {
        Duration::from_secs(self.message_search_timeout_sec)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }

    pub fn teardown_guard(&self) -> Duration {
        Duration::from_secs(self.teardown_guard_sec)
    }

    /// Report directory of one test case.
    pub fn test_case_report_dir(&self, test_case_name: &str) -> PathBuf {
        self.report_dir.join(test_case_name)
    }
}
