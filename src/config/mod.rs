//! Configuration module
//!
//! Handles loading and managing scheduler configuration. Values are layered:
//! command-line flags over `TEST_SCHEDULER_*` environment variables over the
//! configuration file over built-in defaults.

mod env;
mod file;

pub use env::{print_env_help, EnvBuilder, EnvConfig, EnvGuard};
pub use file::{expand_path, ConfigFile};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub(crate) use file::is_yaml_file;

/// Worker pool size used when nothing else is configured
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Scheduler configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Global concurrency ceiling
    pub concurrency: usize,

    /// Timeout for units without their own, in seconds
    pub default_timeout_secs: Option<u64>,

    /// Time a timed-out action gets to honour cancellation
    pub cancel_grace_ms: u64,

    /// Output format (table, json, csv, summary)
    pub format: String,

    /// Where run results are stored
    pub results_dir: Option<PathBuf>,

    /// Shell used for plan commands
    pub shell: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            default_timeout_secs: None,
            cancel_grace_ms: 5_000,
            format: "table".to_string(),
            results_dir: None,
            shell: "sh".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs.map(Duration::from_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Override with any `TEST_SCHEDULER_*` values that are set
    pub fn apply_env(&mut self, env: &EnvConfig) {
        if let Some(concurrency) = env.concurrency {
            self.concurrency = concurrency;
        }
        if let Some(timeout) = env.timeout {
            self.default_timeout_secs = Some(timeout);
        }
        if let Some(format) = &env.format {
            self.format = format.clone();
        }
        if let Some(dir) = &env.results_dir {
            self.results_dir = Some(expand_path(dir));
        }
    }

    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context("Failed to read config file")?;

        let config: Self = if is_yaml_file(path) {
            serde_yaml::from_str(&content).context("Failed to parse YAML config")?
        } else {
            serde_json::from_str(&content).context("Failed to parse JSON config")?
        };

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml_file(path) {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        };

        std::fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }
}
