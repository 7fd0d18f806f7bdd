//! Output formatters for run results
//!
//! Provides table, JSON, CSV and summary output formats.

use anyhow::{Context, Result};
use std::path::Path;

use crate::models::{OutcomeStatus, RunSummary, UnitResult};

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    JsonPretty,
    Csv,
    Summary,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "table" => Some(OutputFormat::Table),
            "json" => Some(OutputFormat::Json),
            "json-pretty" | "jsonpretty" => Some(OutputFormat::JsonPretty),
            "csv" => Some(OutputFormat::Csv),
            "summary" => Some(OutputFormat::Summary),
            _ => None,
        }
    }

    /// Formats whose per-unit lines make sense while the run is in progress
    pub fn is_streaming(&self) -> bool {
        matches!(self, OutputFormat::Table | OutputFormat::Summary)
    }
}

/// Result formatter
pub struct ResultFormatter {
    format: OutputFormat,
    colorize: bool,
}

impl ResultFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            colorize: true,
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Format a single unit result
    pub fn format_result(&self, result: &UnitResult) -> String {
        match self.format {
            OutputFormat::Table => self.format_result_table(result),
            OutputFormat::Json => serde_json::to_string(result).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(result).unwrap_or_default(),
            OutputFormat::Csv => csv_rows(std::slice::from_ref(result), false).unwrap_or_default(),
            OutputFormat::Summary => self.format_result_summary(result),
        }
    }

    fn status_label(&self, status: OutcomeStatus) -> String {
        let label = format!("{} {}", status.symbol(), status);
        if !self.colorize {
            return label;
        }
        let color = match status {
            OutcomeStatus::Passed => "32",
            OutcomeStatus::Failed | OutcomeStatus::Errored => "31",
            OutcomeStatus::Skipped => "33",
        };
        format!("\x1b[{color}m{label}\x1b[0m")
    }

    fn format_result_table(&self, result: &UnitResult) -> String {
        let mut line = format!(
            "{:32} {} [{:>6}ms]",
            truncate(&result.name, 32),
            self.status_label(result.status()),
            result.duration_ms
        );
        if result.attempts > 1 {
            line.push_str(&format!(" ({} attempts)", result.attempts));
        }
        if result.flaky {
            line.push_str(" [flaky]");
        }
        if let Some(message) = result.outcome.message() {
            line.push_str(&format!(" - {message}"));
        }
        line
    }

    fn format_result_summary(&self, result: &UnitResult) -> String {
        format!(
            "{} {} ({}ms)",
            result.status().symbol(),
            result.name,
            result.duration_ms
        )
    }

    /// Format a run summary
    pub fn format_summary(&self, summary: &RunSummary) -> String {
        match self.format {
            OutputFormat::Table => self.format_summary_table(summary),
            OutputFormat::Json => serde_json::to_string(summary).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(summary).unwrap_or_default(),
            OutputFormat::Csv => csv_rows(&summary.results, true).unwrap_or_default(),
            OutputFormat::Summary => self.format_summary_brief(summary),
        }
    }

    fn format_summary_table(&self, summary: &RunSummary) -> String {
        let mut output = String::new();

        output.push_str("\n╔══════════════════════════════════════════════════════════════╗\n");
        output.push_str(&format!("║  Test Run - {:3} units{:40}║\n", summary.total, ""));
        output.push_str("╠══════════════════════════════════════════════════════════════╣\n");

        for result in &summary.results {
            output.push_str(&format!("║  {}\n", self.format_result_table(result)));
        }

        output.push_str("╠══════════════════════════════════════════════════════════════╣\n");

        let pass_str = if self.colorize {
            format!("\x1b[32m{}\x1b[0m", summary.passed)
        } else {
            summary.passed.to_string()
        };
        let fail_str = if self.colorize && summary.failed > 0 {
            format!("\x1b[31m{}\x1b[0m", summary.failed)
        } else {
            summary.failed.to_string()
        };

        output.push_str(&format!(
            "║  Total: {:3} | Pass: {} | Fail: {} | Error: {:2} | Skip: {:2} | Flaky: {:2}\n",
            summary.total, pass_str, fail_str, summary.errored, summary.skipped, summary.flaky
        ));
        output.push_str(&format!(
            "║  Pass Rate: {:5.1}% | Duration: {:6}ms\n",
            summary.pass_rate(),
            summary.total_duration_ms
        ));
        if let Some(diagnostic) = &summary.diagnostic {
            output.push_str(&format!("║  ! {diagnostic}\n"));
        }
        output.push_str("╚══════════════════════════════════════════════════════════════╝\n");

        output
    }

    fn format_summary_brief(&self, summary: &RunSummary) -> String {
        let mut line = format!(
            "{}/{} passed ({:.1}%), {} failed, {} errored, {} skipped in {}ms",
            summary.passed,
            summary.total,
            summary.pass_rate(),
            summary.failed,
            summary.errored,
            summary.skipped,
            summary.total_duration_ms
        );
        if let Some(diagnostic) = &summary.diagnostic {
            line.push_str(&format!(" ({diagnostic})"));
        }
        line
    }
}

impl Default for ResultFormatter {
    fn default() -> Self {
        Self::new(OutputFormat::Table)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut cut: String = s.chars().take(max.saturating_sub(1)).collect();
        cut.push('…');
        cut
    }
}

/// Render unit results as CSV
pub fn csv_rows(results: &[UnitResult], header: bool) -> Result<String> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());

    if header {
        writer.write_record(["key", "name", "status", "duration_ms", "attempts", "flaky", "message"])?;
    }
    for result in results {
        let status = result.status().to_string();
        let duration = result.duration_ms.to_string();
        let attempts = result.attempts.to_string();
        let flaky = result.flaky.to_string();
        writer.write_record([
            result.key.as_str(),
            result.name.as_str(),
            status.as_str(),
            duration.as_str(),
            attempts.as_str(),
            flaky.as_str(),
            result.outcome.message().unwrap_or(""),
        ])?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush CSV output: {}", e.error()))?;
    String::from_utf8(bytes).context("CSV output was not valid UTF-8")
}

/// Write a run summary to a file
pub fn write_results_to_file(
    path: impl AsRef<Path>,
    summary: &RunSummary,
    format: OutputFormat,
) -> Result<()> {
    let path = path.as_ref();
    let formatter = ResultFormatter::new(format).no_color();
    let content = formatter.format_summary(summary);

    std::fs::write(path, content)
        .with_context(|| format!("Failed to write results to {}", path.display()))?;

    Ok(())
}
