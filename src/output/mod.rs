//! Output formatting module
//!
//! Provides various output formats for run results.

mod console;
mod formatter;

pub use console::ConsoleReporter;
pub use formatter::{csv_rows, write_results_to_file, OutputFormat, ResultFormatter};
