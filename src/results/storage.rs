//! Results storage and retrieval
//!
//! Persists finished runs as JSON documents, one file per run.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::models::RunSummary;

/// A finished run as written to disk
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredRun {
    /// Unique run ID
    pub id: String,

    /// Plan the units came from
    pub plan: String,

    /// Timestamp when the run started
    pub started_at: DateTime<Utc>,

    /// Timestamp when the run completed
    pub completed_at: DateTime<Utc>,

    /// Scheduler settings in effect
    pub config: RunConfig,

    /// Environment info
    pub environment: EnvironmentInfo,

    /// Per-unit results and counts
    pub summary: RunSummary,
}

/// Scheduler settings recorded alongside a run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub concurrency: usize,
    pub default_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Environment information
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub os: String,
    pub arch: String,
    pub hostname: Option<String>,
    pub tool_version: String,
}

impl Default for EnvironmentInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            hostname: std::env::var("HOSTNAME").ok(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl StoredRun {
    /// Wrap a finished summary; `started_at` is derived from its duration
    pub fn new(plan: impl Into<String>, summary: RunSummary) -> Self {
        let completed_at = Utc::now();
        let started_at =
            completed_at - chrono::Duration::milliseconds(summary.total_duration_ms as i64);
        Self {
            id: generate_run_id(),
            plan: plan.into(),
            started_at,
            completed_at,
            config: RunConfig::default(),
            environment: EnvironmentInfo::default(),
            summary,
        }
    }

    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    pub fn info(&self) -> RunInfo {
        RunInfo {
            id: self.id.clone(),
            plan: self.plan.clone(),
            started_at: self.started_at,
            total: self.summary.total,
            passed: self.summary.passed,
            pass_rate: self.summary.pass_rate(),
        }
    }
}

/// Generate unique run ID
fn generate_run_id() -> String {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let random: u32 = rand::random::<u32>() % 10000;
    format!("{timestamp}_{random:04}")
}

/// Results storage manager
pub struct ResultsStorage {
    base_dir: PathBuf,
}

impl ResultsStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Storage under the platform data directory
    pub fn default_dir() -> Self {
        let base_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("test-scheduler")
            .join("results");
        Self::new(base_dir)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Ensure storage directory exists
    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir).with_context(|| {
            format!(
                "Failed to create results directory {}",
                self.base_dir.display()
            )
        })
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(format!("{run_id}.json"))
    }

    /// Save a run, returning the file it was written to
    pub fn save(&self, run: &StoredRun) -> Result<PathBuf> {
        self.ensure_dir()?;

        let path = self.run_path(&run.id);
        let file = File::create(&path).context("Failed to create results file")?;
        let writer = BufWriter::new(file);

        serde_json::to_writer_pretty(writer, run).context("Failed to write results")?;

        info!("Saved run results to {}", path.display());
        Ok(path)
    }

    /// Load a run by ID
    pub fn load(&self, run_id: &str) -> Result<StoredRun> {
        let path = self.run_path(run_id);
        let run = self
            .load_from_path(&path)
            .with_context(|| format!("Run {run_id} not found in {}", self.base_dir.display()))?;
        debug!("Loaded run results from {}", path.display());
        Ok(run)
    }

    /// Load from a specific path
    pub fn load_from_path(&self, path: &Path) -> Result<StoredRun> {
        let file = File::open(path).context("Failed to open results file")?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).context("Failed to parse results")
    }

    /// All readable runs, newest first
    pub fn load_all(&self) -> Result<Vec<StoredRun>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                match self.load_from_path(&path) {
                    Ok(run) => runs.push(run),
                    Err(e) => debug!("Failed to load {}: {}", path.display(), e),
                }
            }
        }

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    /// Brief listing of stored runs, newest first
    pub fn list_runs(&self) -> Result<Vec<RunInfo>> {
        Ok(self.load_all()?.iter().map(StoredRun::info).collect())
    }

    pub fn latest(&self) -> Result<Option<StoredRun>> {
        Ok(self.load_all()?.into_iter().next())
    }

    pub fn delete(&self, run_id: &str) -> Result<()> {
        let path = self.run_path(run_id);
        if path.exists() {
            fs::remove_file(&path)?;
            info!("Deleted results: {}", path.display());
        }
        Ok(())
    }

    /// Export run to a file
    pub fn export(&self, run: &StoredRun, path: &Path, format: ExportFormat) -> Result<()> {
        match format {
            ExportFormat::Json => {
                let file = File::create(path)
                    .with_context(|| format!("Failed to create {}", path.display()))?;
                serde_json::to_writer_pretty(BufWriter::new(file), run)?;
            }
            ExportFormat::Csv => {
                let mut writer = csv::Writer::from_path(path)?;
                writer.write_record([
                    "run_id",
                    "key",
                    "name",
                    "status",
                    "duration_ms",
                    "attempts",
                    "flaky",
                    "message",
                ])?;

                for result in &run.summary.results {
                    writer.write_record([
                        run.id.clone(),
                        result.key.to_string(),
                        result.name.clone(),
                        result.status().to_string(),
                        result.duration_ms.to_string(),
                        result.attempts.to_string(),
                        result.flaky.to_string(),
                        result.outcome.message().unwrap_or_default().to_string(),
                    ])?;
                }
                writer.flush()?;
            }
        }

        info!("Exported results to {}", path.display());
        Ok(())
    }
}

/// Brief run information
#[derive(Clone, Debug)]
pub struct RunInfo {
    pub id: String,
    pub plan: String,
    pub started_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub pass_rate: f64,
}

/// Export format
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(ExportFormat::Json),
            "csv" => Some(ExportFormat::Csv),
            _ => None,
        }
    }

    pub fn from_extension(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TerminalOutcome, UnitKey, UnitResult};
    use tempfile::tempdir;

    fn summary() -> RunSummary {
        let result = |key: &str, outcome| UnitResult {
            key: UnitKey::new(key),
            name: key.to_string(),
            tags: Vec::new(),
            outcome,
            duration_ms: 3,
            attempts: 1,
            flaky: false,
            output: None,
        };
        RunSummary::new(
            vec![
                result("build", TerminalOutcome::Passed),
                result("deploy", TerminalOutcome::failed("exit status 2")),
            ],
            40,
            None,
        )
    }

    #[test]
    fn test_generate_run_id() {
        let id = generate_run_id();
        assert_eq!(id.len(), "20260101_120000_0000".len());
        assert_eq!(id.matches('_').count(), 2);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let storage = ResultsStorage::new(dir.path().join("results"));
        let run = StoredRun::new("suite.yaml", summary()).with_config(RunConfig {
            concurrency: 2,
            ..Default::default()
        });

        let path = storage.save(&run).unwrap();
        assert!(path.exists());

        let loaded = storage.load(&run.id).unwrap();
        assert_eq!(loaded.id, run.id);
        assert_eq!(loaded.plan, "suite.yaml");
        assert_eq!(loaded.config.concurrency, 2);
        assert_eq!(loaded.summary.total, 2);
        assert_eq!(
            loaded.summary.result("deploy").map(|r| r.outcome.clone()),
            Some(TerminalOutcome::failed("exit status 2"))
        );
    }

    #[test]
    fn test_list_and_latest() {
        let dir = tempdir().unwrap();
        let storage = ResultsStorage::new(dir.path());
        assert!(storage.latest().unwrap().is_none());

        let mut older = StoredRun::new("a.yaml", summary());
        older.id = "older".to_string();
        older.started_at -= chrono::Duration::hours(1);
        let mut newer = StoredRun::new("b.yaml", summary());
        newer.id = "newer".to_string();
        storage.save(&older).unwrap();
        storage.save(&newer).unwrap();
        std::fs::write(dir.path().join("junk.json"), "not json").unwrap();

        let runs = storage.list_runs().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, "newer");
        assert_eq!(runs[0].passed, 1);
        assert_eq!(storage.latest().unwrap().map(|r| r.plan), Some("b.yaml".to_string()));

        storage.delete("older").unwrap();
        assert_eq!(storage.list_runs().unwrap().len(), 1);
    }

    #[test]
    fn test_export_csv() {
        let dir = tempdir().unwrap();
        let storage = ResultsStorage::new(dir.path());
        let mut run = StoredRun::new("suite.yaml", summary());
        run.id = "r1".to_string();

        let path = dir.path().join("out.csv");
        storage.export(&run, &path, ExportFormat::Csv).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2], "r1,deploy,deploy,FAIL,3,1,false,exit status 2");
    }

    #[test]
    fn test_export_format() {
        assert_eq!(ExportFormat::from_str("JSON"), Some(ExportFormat::Json));
        assert_eq!(
            ExportFormat::from_extension(Path::new("out.csv")),
            Some(ExportFormat::Csv)
        );
        assert!(ExportFormat::from_str("xml").is_none());
    }

    #[test]
    fn test_environment_info() {
        let env = EnvironmentInfo::default();
        assert!(!env.os.is_empty());
        assert_eq!(env.tool_version, env!("CARGO_PKG_VERSION"));
    }
}
