//! Result reporting
//!
//! The scheduler streams exactly one terminal report per unit through the
//! [`Reporter`] trait. Calls arrive concurrently from worker tasks.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::action::panic_message;
use crate::models::{RunDiagnostic, TerminalOutcome, TestUnit, UnitKey, UnitReport};

/// Sink for terminal outcomes
pub trait Reporter: Send + Sync {
    /// A unit was admitted and is about to run
    fn unit_started(&self, _unit: &TestUnit) {}

    fn report_passed(&self, unit: &TestUnit, report: &UnitReport);

    fn report_failed(&self, unit: &TestUnit, reason: &str, report: &UnitReport);

    fn report_errored(&self, unit: &TestUnit, error: &str, report: &UnitReport);

    fn report_skipped(&self, unit: &TestUnit, reason: &str);

    /// Run-level problem: cancellation or a stalled graph
    fn run_diagnostic(&self, _diagnostic: &RunDiagnostic) {}
}

/// Route a report to the matching reporter call
pub(crate) fn publish(reporter: &dyn Reporter, unit: &TestUnit, report: &UnitReport) {
    guarded("report", || match &report.outcome {
        TerminalOutcome::Passed => reporter.report_passed(unit, report),
        TerminalOutcome::Failed { reason } => reporter.report_failed(unit, reason, report),
        TerminalOutcome::Errored { error } => reporter.report_errored(unit, error, report),
        TerminalOutcome::Skipped { reason } => reporter.report_skipped(unit, reason),
    });
}

/// Call into a reporter; a panic is logged and does not reach the worker.
pub(crate) fn guarded(call: &str, f: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        error!(call, panic = %panic_message(payload), "reporter panicked");
    }
}

/// What happened to a unit, as seen by a reporter
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    Started,
    Finished(TerminalOutcome),
}

#[derive(Clone, Debug)]
pub struct ReportEvent {
    pub key: UnitKey,
    pub kind: EventKind,
    pub at: Instant,
    pub output: String,
    pub attempts: u32,
    pub flaky: bool,
}

/// Keeps every event in memory, in arrival order
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<ReportEvent>>,
    diagnostics: Mutex<Vec<RunDiagnostic>>,
}

impl CollectingReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, unit: &TestUnit, kind: EventKind, report: Option<&UnitReport>) {
        self.events.lock().push(ReportEvent {
            key: unit.key.clone(),
            kind,
            at: Instant::now(),
            output: report.map(|r| r.output.clone()).unwrap_or_default(),
            attempts: report.map(|r| r.attempts).unwrap_or(0),
            flaky: report.map(|r| r.flaky).unwrap_or(false),
        });
    }

    pub fn events(&self) -> Vec<ReportEvent> {
        self.events.lock().clone()
    }

    pub fn diagnostics(&self) -> Vec<RunDiagnostic> {
        self.diagnostics.lock().clone()
    }

    /// Terminal events only, in publication order
    pub fn terminal(&self) -> Vec<(UnitKey, TerminalOutcome)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match &event.kind {
                EventKind::Finished(outcome) => Some((event.key.clone(), outcome.clone())),
                EventKind::Started => None,
            })
            .collect()
    }

    /// Terminal outcome of `key`, if reported
    pub fn outcome(&self, key: &str) -> Option<TerminalOutcome> {
        self.terminal()
            .into_iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, outcome)| outcome)
    }

    /// Number of terminal reports received for `key`
    pub fn report_count(&self, key: &str) -> usize {
        self.terminal()
            .iter()
            .filter(|(k, _)| k.as_str() == key)
            .count()
    }

    /// Position of the event in the log
    pub fn position(&self, key: &str, started: bool) -> Option<usize> {
        self.events.lock().iter().position(|event| {
            event.key.as_str() == key && (event.kind == EventKind::Started) == started
        })
    }

    pub fn event(&self, key: &str, started: bool) -> Option<ReportEvent> {
        self.position(key, started)
            .and_then(|i| self.events.lock().get(i).cloned())
    }

    pub fn started(&self) -> Vec<UnitKey> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.kind == EventKind::Started)
            .map(|event| event.key.clone())
            .collect()
    }
}

impl Reporter for CollectingReporter {
    fn unit_started(&self, unit: &TestUnit) {
        self.push(unit, EventKind::Started, None);
    }

    fn report_passed(&self, unit: &TestUnit, report: &UnitReport) {
        self.push(unit, EventKind::Finished(TerminalOutcome::Passed), Some(report));
    }

    fn report_failed(&self, unit: &TestUnit, reason: &str, report: &UnitReport) {
        self.push(
            unit,
            EventKind::Finished(TerminalOutcome::failed(reason)),
            Some(report),
        );
    }

    fn report_errored(&self, unit: &TestUnit, error: &str, report: &UnitReport) {
        self.push(
            unit,
            EventKind::Finished(TerminalOutcome::errored(error)),
            Some(report),
        );
    }

    fn report_skipped(&self, unit: &TestUnit, reason: &str) {
        self.push(unit, EventKind::Finished(TerminalOutcome::skipped(reason)), None);
    }

    fn run_diagnostic(&self, diagnostic: &RunDiagnostic) {
        self.diagnostics.lock().push(diagnostic.clone());
    }
}

/// Emits one structured log line per outcome
#[derive(Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn unit_started(&self, unit: &TestUnit) {
        tracing::debug!(unit = %unit.key, "started");
    }

    fn report_passed(&self, unit: &TestUnit, report: &UnitReport) {
        info!(
            unit = %unit.key,
            attempts = report.attempts,
            duration_ms = report.duration.as_millis() as u64,
            flaky = report.flaky,
            "passed"
        );
    }

    fn report_failed(&self, unit: &TestUnit, reason: &str, report: &UnitReport) {
        warn!(unit = %unit.key, attempts = report.attempts, reason, "failed");
    }

    fn report_errored(&self, unit: &TestUnit, error: &str, report: &UnitReport) {
        warn!(unit = %unit.key, attempts = report.attempts, error, "errored");
    }

    fn report_skipped(&self, unit: &TestUnit, reason: &str) {
        info!(unit = %unit.key, reason, "skipped");
    }

    fn run_diagnostic(&self, diagnostic: &RunDiagnostic) {
        error!(%diagnostic, "run did not complete normally");
    }
}

/// Forwards every call to each inner reporter in turn
#[derive(Default)]
pub struct CompositeReporter {
    reporters: Vec<Arc<dyn Reporter>>,
}

impl CompositeReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

impl Reporter for CompositeReporter {
    fn unit_started(&self, unit: &TestUnit) {
        for r in &self.reporters {
            r.unit_started(unit);
        }
    }

    fn report_passed(&self, unit: &TestUnit, report: &UnitReport) {
        for r in &self.reporters {
            r.report_passed(unit, report);
        }
    }

    fn report_failed(&self, unit: &TestUnit, reason: &str, report: &UnitReport) {
        for r in &self.reporters {
            r.report_failed(unit, reason, report);
        }
    }

    fn report_errored(&self, unit: &TestUnit, error: &str, report: &UnitReport) {
        for r in &self.reporters {
            r.report_errored(unit, error, report);
        }
    }

    fn report_skipped(&self, unit: &TestUnit, reason: &str) {
        for r in &self.reporters {
            r.report_skipped(unit, reason);
        }
    }

    fn run_diagnostic(&self, diagnostic: &RunDiagnostic) {
        for r in &self.reporters {
            r.run_diagnostic(diagnostic);
        }
    }
}
