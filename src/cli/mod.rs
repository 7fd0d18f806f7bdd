//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Parser, Subcommand};

/// Dependency-aware, constraint-respecting test scheduler
#[derive(Parser, Debug)]
#[command(name = "test-scheduler")]
#[command(version)]
#[command(about = "Run a suite of test commands with dependencies, constraints and lifecycle hooks")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (defaults to the first one found in standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the units of a plan
    Run(RunArgs),

    /// List the units of a plan
    List(ListArgs),

    /// Validate a plan without running it
    Validate(ValidateArgs),

    /// View stored run results
    Results(ResultsArgs),

    /// Manage configuration files
    Config(ConfigArgs),

    /// Show supported environment variables and their current values
    Env,
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Plan file (YAML or JSON)
    pub plan: String,

    /// Maximum number of units running at once
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Default per-unit timeout in seconds
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Output format (table, json, json-pretty, csv, summary)
    #[arg(short, long)]
    pub format: Option<String>,

    /// Only run units whose key or name contains this text (plus their dependencies)
    #[arg(long)]
    pub filter: Option<String>,

    /// Only run units carrying one of these tags (plus their dependencies)
    #[arg(long, value_delimiter = ',')]
    pub tag: Vec<String>,

    /// Store the run in the results directory
    #[arg(short, long)]
    pub save: bool,

    /// Write the formatted results to a file
    #[arg(short, long)]
    pub output: Option<String>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,
}

/// Arguments for list command
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Plan file (YAML or JSON)
    pub plan: String,

    /// Show scheduling metadata of each unit
    #[arg(short, long)]
    pub detailed: bool,
}

/// Arguments for validate command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Plan file (YAML or JSON)
    pub plan: String,
}

/// Arguments for results command
#[derive(Parser, Debug)]
pub struct ResultsArgs {
    /// Show the most recent run in full
    #[arg(short, long)]
    pub latest: bool,

    /// Show a specific run
    #[arg(long)]
    pub run: Option<String>,

    /// Output format (table, json, json-pretty, csv, summary)
    #[arg(short, long, default_value = "table")]
    pub format: String,

    /// Export the selected run to a file (.json or .csv)
    #[arg(short, long)]
    pub export: Option<String>,
}

/// Arguments for config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write an example configuration file
    Init {
        /// Output path
        #[arg(short, long, default_value = "./test-scheduler.yaml")]
        output: String,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the effective configuration
    Show {
        /// Output format (yaml, json)
        #[arg(short, long, default_value = "yaml")]
        format: String,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file to validate
        file: Option<String>,
    },
}
