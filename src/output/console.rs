//! Streaming console output

use std::io::Write;

use super::formatter::{OutputFormat, ResultFormatter};
use crate::models::{RunDiagnostic, TestUnit, UnitReport, UnitResult};
use crate::scheduler::Reporter;

/// Prints one line per finished unit as outcomes arrive
pub struct ConsoleReporter {
    formatter: ResultFormatter,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            formatter: ResultFormatter::new(format),
            verbose: false,
        }
    }

    pub fn no_color(mut self) -> Self {
        self.formatter = self.formatter.no_color();
        self
    }

    /// Also print captured output of units that did not pass
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Lines printed for one outcome; none for non-streaming formats
    fn render(&self, unit: &TestUnit, report: &UnitReport) -> Vec<String> {
        if !self.formatter.format().is_streaming() {
            return Vec::new();
        }

        let result = UnitResult::from_report(unit, report);
        let mut lines = vec![self.formatter.format_result(&result)];
        if self.verbose && !report.outcome.is_passed() {
            lines.extend(report.output.lines().map(|line| format!("    | {line}")));
        }
        lines
    }

    fn emit(&self, unit: &TestUnit, report: &UnitReport) {
        let lines = self.render(unit, report);
        if lines.is_empty() {
            return;
        }

        // One lock per outcome keeps lines from concurrent workers together
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for line in lines {
            let _ = writeln!(out, "{line}");
        }
    }
}

impl Reporter for ConsoleReporter {
    fn report_passed(&self, unit: &TestUnit, report: &UnitReport) {
        self.emit(unit, report);
    }

    fn report_failed(&self, unit: &TestUnit, _reason: &str, report: &UnitReport) {
        self.emit(unit, report);
    }

    fn report_errored(&self, unit: &TestUnit, _error: &str, report: &UnitReport) {
        self.emit(unit, report);
    }

    fn report_skipped(&self, unit: &TestUnit, reason: &str) {
        self.emit(unit, &UnitReport::skipped(reason));
    }

    fn run_diagnostic(&self, diagnostic: &RunDiagnostic) {
        eprintln!("! {diagnostic}");
    }
}
