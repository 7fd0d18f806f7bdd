//! Outcome models
//!
//! Defines terminal outcomes, per-attempt execution records, per-unit
//! results and the run summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::unit::{TestUnit, UnitKey};

/// Final, immutable result of a unit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TerminalOutcome {
    Passed,
    Failed { reason: String },
    Errored { error: String },
    Skipped { reason: String },
}

impl TerminalOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        TerminalOutcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn errored(error: impl Into<String>) -> Self {
        TerminalOutcome::Errored {
            error: error.into(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        TerminalOutcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn status(&self) -> OutcomeStatus {
        match self {
            TerminalOutcome::Passed => OutcomeStatus::Passed,
            TerminalOutcome::Failed { .. } => OutcomeStatus::Failed,
            TerminalOutcome::Errored { .. } => OutcomeStatus::Errored,
            TerminalOutcome::Skipped { .. } => OutcomeStatus::Skipped,
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, TerminalOutcome::Passed)
    }

    /// Reason or error text, if any
    pub fn message(&self) -> Option<&str> {
        match self {
            TerminalOutcome::Passed => None,
            TerminalOutcome::Failed { reason } | TerminalOutcome::Skipped { reason } => {
                Some(reason.as_str())
            }
            TerminalOutcome::Errored { error } => Some(error.as_str()),
        }
    }
}

impl fmt::Display for TerminalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{} ({msg})", self.status()),
            None => write!(f, "{}", self.status()),
        }
    }
}

/// Outcome kind without payload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Passed,
    Failed,
    Errored,
    Skipped,
}

impl OutcomeStatus {
    pub fn symbol(&self) -> &'static str {
        match self {
            OutcomeStatus::Passed => "✓",
            OutcomeStatus::Failed => "✗",
            OutcomeStatus::Skipped => "○",
            OutcomeStatus::Errored => "!",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeStatus::Passed)
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeStatus::Passed => write!(f, "PASS"),
            OutcomeStatus::Failed => write!(f, "FAIL"),
            OutcomeStatus::Skipped => write!(f, "SKIP"),
            OutcomeStatus::Errored => write!(f, "ERROR"),
        }
    }
}

/// One attempt of one unit
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: TerminalOutcome,
    pub output: String,
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub fn new(
        attempt: u32,
        started_at: DateTime<Utc>,
        outcome: TerminalOutcome,
        output: String,
    ) -> Self {
        let error = match &outcome {
            TerminalOutcome::Failed { reason } => Some(reason.clone()),
            TerminalOutcome::Errored { error } => Some(error.clone()),
            _ => None,
        };
        Self {
            attempt,
            started_at,
            ended_at: Utc::now(),
            outcome,
            output,
            error,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        (self.ended_at - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// Everything the reporter learns about a finished unit
#[derive(Clone, Debug)]
pub struct UnitReport {
    pub outcome: TerminalOutcome,
    /// Captured output of the last attempt
    pub output: String,
    pub attempts: u32,
    pub duration: Duration,
    /// Unit was marked flaky
    pub flaky: bool,
    pub records: Vec<ExecutionRecord>,
}

impl UnitReport {
    /// Build from the attempt records; the last attempt decides the outcome.
    pub fn from_records(records: Vec<ExecutionRecord>, duration: Duration, flaky: bool) -> Self {
        let (outcome, output) = match records.last() {
            Some(last) => (last.outcome.clone(), last.output.clone()),
            None => (TerminalOutcome::errored("no attempt was made"), String::new()),
        };
        Self {
            outcome,
            output,
            attempts: records.len() as u32,
            duration,
            flaky,
            records,
        }
    }

    /// Outcome decided without running the unit
    pub fn synthetic(outcome: TerminalOutcome) -> Self {
        Self {
            outcome,
            output: String::new(),
            attempts: 0,
            duration: Duration::ZERO,
            flaky: false,
            records: Vec::new(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::synthetic(TerminalOutcome::skipped(reason))
    }

    /// Passed, but only after at least one failing attempt
    pub fn passed_after_retry(&self) -> bool {
        self.outcome.is_passed() && self.attempts > 1
    }
}

/// Serializable per-unit result
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnitResult {
    pub key: UnitKey,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub outcome: TerminalOutcome,
    pub duration_ms: u64,
    pub attempts: u32,
    pub flaky: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl UnitResult {
    pub fn from_report(unit: &TestUnit, report: &UnitReport) -> Self {
        Self {
            key: unit.key.clone(),
            name: unit.display_name.clone(),
            tags: unit.tags.clone(),
            outcome: report.outcome.clone(),
            duration_ms: report.duration.as_millis() as u64,
            attempts: report.attempts,
            flaky: report.flaky,
            output: (!report.output.is_empty()).then(|| report.output.clone()),
        }
    }

    pub fn status(&self) -> OutcomeStatus {
        self.outcome.status()
    }
}

impl fmt::Display for UnitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}ms]",
            self.status().symbol(),
            self.name,
            self.duration_ms
        )?;
        if self.attempts > 1 {
            write!(f, " ({} attempts)", self.attempts)?;
        }
        if self.flaky {
            write!(f, " [flaky]")?;
        }
        if let Some(msg) = self.outcome.message() {
            write!(f, " - {msg}")?;
        }
        Ok(())
    }
}

/// Run-level problem, reported once per run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RunDiagnostic {
    /// Cancellation was requested; `skipped` units never started
    Cancelled { skipped: usize },
    /// No progress possible while units were still waiting on dependencies
    Stalled { unresolved: Vec<UnitKey> },
}

impl fmt::Display for RunDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunDiagnostic::Cancelled { skipped } => {
                write!(f, "run cancelled, {skipped} unit(s) never started")
            }
            RunDiagnostic::Stalled { unresolved } => {
                let keys: Vec<&str> = unresolved.iter().map(UnitKey::as_str).collect();
                write!(
                    f,
                    "scheduler stalled with {} unresolved unit(s), likely a dependency cycle: {}",
                    unresolved.len(),
                    keys.join(", ")
                )
            }
        }
    }
}

/// Summary of one scheduler run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
    pub flaky: usize,
    pub total_duration_ms: u64,
    /// In publication order
    pub results: Vec<UnitResult>,
    pub diagnostic: Option<RunDiagnostic>,
}

impl RunSummary {
    pub fn new(
        results: Vec<UnitResult>,
        total_duration_ms: u64,
        diagnostic: Option<RunDiagnostic>,
    ) -> Self {
        let count = |status: OutcomeStatus| results.iter().filter(|r| r.status() == status).count();

        Self {
            total: results.len(),
            passed: count(OutcomeStatus::Passed),
            failed: count(OutcomeStatus::Failed),
            errored: count(OutcomeStatus::Errored),
            skipped: count(OutcomeStatus::Skipped),
            flaky: results.iter().filter(|r| r.flaky).count(),
            total_duration_ms,
            results,
            diagnostic,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), 0, None)
    }

    pub fn pass_rate(&self) -> f64 {
        let executed = self.total - self.skipped;
        if executed == 0 {
            0.0
        } else {
            (self.passed as f64 / executed as f64) * 100.0
        }
    }

    /// No failures, no errors and no run-level diagnostic
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.errored == 0 && self.diagnostic.is_none()
    }

    pub fn result(&self, key: &str) -> Option<&UnitResult> {
        self.results.iter().find(|r| r.key.as_str() == key)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        for result in &self.results {
            writeln!(f, "  {result}")?;
        }
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(
            f,
            "Total: {} | Pass: {} | Fail: {} | Error: {} | Skip: {} | Flaky: {}",
            self.total, self.passed, self.failed, self.errored, self.skipped, self.flaky
        )?;
        write!(
            f,
            "Pass Rate: {:.1}% | Duration: {}ms",
            self.pass_rate(),
            self.total_duration_ms
        )?;
        if let Some(diagnostic) = &self.diagnostic {
            write!(f, "\n{diagnostic}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(key: &str, outcome: TerminalOutcome) -> UnitResult {
        UnitResult {
            key: UnitKey::new(key),
            name: key.to_string(),
            tags: Vec::new(),
            outcome,
            duration_ms: 10,
            attempts: 1,
            flaky: false,
            output: None,
        }
    }

    #[test]
    fn test_outcome_message() {
        assert_eq!(TerminalOutcome::Passed.message(), None);
        assert_eq!(TerminalOutcome::failed("timeout").message(), Some("timeout"));
        assert_eq!(
            TerminalOutcome::skipped("run cancelled").to_string(),
            "SKIP (run cancelled)"
        );
    }

    #[test]
    fn test_report_uses_last_attempt() {
        let now = Utc::now();
        let records = vec![
            ExecutionRecord::new(1, now, TerminalOutcome::failed("boom"), "first".into()),
            ExecutionRecord::new(2, now, TerminalOutcome::Passed, "second".into()),
        ];

        let report = UnitReport::from_records(records, Duration::from_millis(5), true);
        assert!(report.outcome.is_passed());
        assert_eq!(report.output, "second");
        assert_eq!(report.attempts, 2);
        assert!(report.passed_after_retry());
        assert_eq!(report.records[0].error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_run_summary_counts() {
        let results = vec![
            result("a", TerminalOutcome::Passed),
            result("b", TerminalOutcome::failed("assertion")),
            result("c", TerminalOutcome::errored("panic")),
            result("d", TerminalOutcome::skipped("upstream dependency failed")),
        ];

        let summary = RunSummary::new(results, 40, None);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errored, 1);
        assert_eq!(summary.skipped, 1);
        assert!(!summary.is_success());
        assert!((summary.pass_rate() - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_string(&TerminalOutcome::failed("timeout")).unwrap();
        assert_eq!(json, r#"{"status":"failed","reason":"timeout"}"#);
    }

    #[test]
    fn test_empty_summary_is_success() {
        let summary = RunSummary::empty();
        assert!(summary.is_success());
        assert_eq!(summary.pass_rate(), 0.0);
    }
}
