//! Environment variable configuration
//!
//! Provides environment variable overrides for configuration.

use std::env;

/// Environment variable prefix
const ENV_PREFIX: &str = "TEST_SCHEDULER";

/// Environment configuration from environment variables
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvConfig {
    /// Concurrency ceiling from TEST_SCHEDULER_CONCURRENCY
    pub concurrency: Option<usize>,
    /// Default timeout in seconds from TEST_SCHEDULER_TIMEOUT
    pub timeout: Option<u64>,
    /// Output format from TEST_SCHEDULER_FORMAT
    pub format: Option<String>,
    /// Config file from TEST_SCHEDULER_CONFIG
    pub config_file: Option<String>,
    /// Results directory from TEST_SCHEDULER_RESULTS_DIR
    pub results_dir: Option<String>,
    /// Verbose from TEST_SCHEDULER_VERBOSE
    pub verbose: Option<bool>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            concurrency: get_env_parse("CONCURRENCY"),
            timeout: get_env_parse("TIMEOUT"),
            format: get_env("FORMAT"),
            config_file: get_env("CONFIG"),
            results_dir: get_env("RESULTS_DIR"),
            verbose: get_env_bool("VERBOSE"),
        }
    }

    /// Check if any environment variables are set
    pub fn has_any(&self) -> bool {
        self.concurrency.is_some()
            || self.timeout.is_some()
            || self.format.is_some()
            || self.config_file.is_some()
            || self.results_dir.is_some()
            || self.verbose.is_some()
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose.unwrap_or(false)
    }

    /// Print current environment configuration
    pub fn print_summary(&self) {
        println!("Environment Configuration:");
        println!("  {}_CONCURRENCY:  {:?}", ENV_PREFIX, self.concurrency);
        println!("  {}_TIMEOUT:      {:?}", ENV_PREFIX, self.timeout);
        println!("  {}_FORMAT:       {:?}", ENV_PREFIX, self.format);
        println!("  {}_CONFIG:       {:?}", ENV_PREFIX, self.config_file);
        println!("  {}_RESULTS_DIR:  {:?}", ENV_PREFIX, self.results_dir);
        println!("  {}_VERBOSE:      {:?}", ENV_PREFIX, self.verbose);
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.trim().parse().ok())
}

/// Get environment variable as boolean
fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

/// Builder for setting environment variables (useful for testing)
#[derive(Default)]
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(mut self, name: &str, value: impl Into<String>) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_{name}"), value.into()));
        self
    }

    pub fn concurrency(self, concurrency: usize) -> Self {
        self.set("CONCURRENCY", concurrency.to_string())
    }

    pub fn timeout(self, timeout: u64) -> Self {
        self.set("TIMEOUT", timeout.to_string())
    }

    pub fn format(self, format: impl Into<String>) -> Self {
        self.set("FORMAT", format)
    }

    pub fn config_file(self, path: impl Into<String>) -> Self {
        self.set("CONFIG", path)
    }

    pub fn results_dir(self, path: impl Into<String>) -> Self {
        self.set("RESULTS_DIR", path)
    }

    pub fn verbose(self, verbose: bool) -> Self {
        self.set("VERBOSE", verbose.to_string())
    }

    /// Apply environment variables
    pub fn apply(self) {
        for (key, value) in self.vars {
            env::set_var(key, value);
        }
    }

    /// Apply and return guard that restores on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        self.apply();

        EnvGuard { previous }
    }
}

/// Guard that restores environment variables on drop
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}

/// Print all TEST_SCHEDULER environment variables
pub fn print_env_help() {
    println!("Environment Variables:");
    println!();
    println!("  {ENV_PREFIX}_CONCURRENCY   Maximum number of units running at once");
    println!("  {ENV_PREFIX}_TIMEOUT       Default per-unit timeout in seconds");
    println!("  {ENV_PREFIX}_FORMAT        Output format (table, json, csv, summary)");
    println!("  {ENV_PREFIX}_CONFIG        Path to configuration file");
    println!("  {ENV_PREFIX}_RESULTS_DIR   Directory for saved run results");
    println!("  {ENV_PREFIX}_VERBOSE       Enable verbose output (true/false)");
    println!("  RUST_LOG                    Overrides the log filter");
    println!();
    println!("Example:");
    println!("  export {ENV_PREFIX}_CONCURRENCY=8");
    println!("  export {ENV_PREFIX}_TIMEOUT=120");
    println!("  test-scheduler run suite.yaml");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_config_default() {
        let config = EnvConfig::default();
        assert!(config.concurrency.is_none());
        assert!(!config.is_verbose());
    }

    #[test]
    fn test_env_builder() {
        let _guard = EnvBuilder::new()
            .concurrency(6)
            .timeout(60)
            .format("csv")
            .apply_scoped();

        let config = EnvConfig::load();
        assert_eq!(config.concurrency, Some(6));
        assert_eq!(config.timeout, Some(60));
        assert_eq!(config.format, Some("csv".to_string()));
    }

    #[test]
    fn test_env_bool_parsing() {
        let _guard = EnvBuilder::new().verbose(true).apply_scoped();

        let config = EnvConfig::load();
        assert_eq!(config.verbose, Some(true));
        assert!(config.is_verbose());
    }

    #[test]
    fn test_guard_restores_previous() {
        {
            let _guard = EnvBuilder::new().results_dir("/tmp/results").apply_scoped();
            assert_eq!(get_env("RESULTS_DIR"), Some("/tmp/results".to_string()));
        }
        assert_eq!(get_env("RESULTS_DIR"), None);
    }

    #[test]
    fn test_has_any() {
        let empty = EnvConfig::default();
        assert!(!empty.has_any());

        let with_timeout = EnvConfig {
            timeout: Some(10),
            ..Default::default()
        };
        assert!(with_timeout.has_any());
    }
}
