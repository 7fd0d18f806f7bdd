//! Test Scheduler - run a suite of test commands as one correct execution
//!
//! A CLI tool that loads a plan file describing test units (shell commands
//! with dependencies, constraints, retries, timeouts and lifecycle hooks)
//! and schedules them concurrently.
//!
//! ## Usage
//!
//! ```bash
//! # Run a plan with up to 8 units at once
//! test-scheduler run suite.yaml -j 8
//!
//! # Run only smoke tests (and whatever they depend on)
//! test-scheduler run suite.yaml --tag smoke
//!
//! # Check a plan for cycles and dangling dependencies
//! test-scheduler validate suite.yaml
//!
//! # Inspect and export stored runs
//! test-scheduler results --latest --export latest.csv
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

mod cli;

use cli::Args;
use test_scheduler::config::{expand_path, print_env_help, ConfigFile, EnvConfig, SchedulerConfig};
use test_scheduler::output::{write_results_to_file, ConsoleReporter, OutputFormat, ResultFormatter};
use test_scheduler::plan::{validate, PlanFile, UnitFilter};
use test_scheduler::results::{ExportFormat, ResultsStorage, RunConfig, StoredRun};
use test_scheduler::scheduler::{CompositeReporter, Scheduler, TracingReporter};
use test_scheduler::utils::logger::{init_logger, LogLevel};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = LogLevel::from_str(&args.log_level).unwrap_or_default();
    init_logger(level);

    let env = EnvConfig::load();
    let verbose = args.verbose || env.is_verbose();

    match args.command {
        cli::Command::Run(run_args) => {
            let config = load_config(args.config.as_deref(), &env)?;
            let success = run_plan(run_args, config, verbose).await?;
            if !success {
                std::process::exit(1);
            }
        }
        cli::Command::List(list_args) => {
            list_units(list_args)?;
        }
        cli::Command::Validate(validate_args) => {
            validate_plan(&validate_args.plan)?;
        }
        cli::Command::Results(results_args) => {
            let config = load_config(args.config.as_deref(), &env)?;
            show_results(results_args, &config)?;
        }
        cli::Command::Config(config_args) => {
            manage_config(config_args, args.config.as_deref(), &env)?;
        }
        cli::Command::Env => {
            print_env_help();
            println!();
            env.print_summary();
        }
    }

    Ok(())
}

/// File (explicit, from the environment, or discovered) overlaid with the environment
fn load_config(explicit: Option<&str>, env: &EnvConfig) -> Result<SchedulerConfig> {
    let file = match explicit.or(env.config_file.as_deref()) {
        Some(path) => ConfigFile::load(expand_path(path))?,
        None => ConfigFile::load_default()?,
    };

    let mut config = file.scheduler;
    config.apply_env(env);
    Ok(config)
}

/// Load a plan and refuse to continue if it has problems
fn load_plan(path: &str) -> Result<PlanFile> {
    let plan = PlanFile::load(path)?;

    let errors = validate(&plan);
    if !errors.is_empty() {
        for error in &errors {
            eprintln!("  ✗ {error}");
        }
        anyhow::bail!("Plan {path} is invalid ({} problem(s))", errors.len());
    }

    Ok(plan)
}

fn results_storage(config: &SchedulerConfig) -> ResultsStorage {
    match &config.results_dir {
        Some(dir) => ResultsStorage::new(dir.clone()),
        None => ResultsStorage::default_dir(),
    }
}

async fn run_plan(args: cli::RunArgs, mut config: SchedulerConfig, verbose: bool) -> Result<bool> {
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(timeout) = args.timeout {
        config.default_timeout_secs = Some(timeout);
    }
    if let Some(format) = &args.format {
        config.format = format.clone();
    }

    let format = OutputFormat::from_str(&config.format)
        .ok_or_else(|| anyhow::anyhow!("Unknown output format: {}", config.format))?;

    let filter = UnitFilter {
        pattern: args.filter.clone(),
        tags: args.tag.clone(),
    };
    let plan = load_plan(&args.plan)?.filter(&filter);
    if plan.units.is_empty() {
        warn!("No units selected from {}", args.plan);
    }
    let plan_name = plan.name.clone().unwrap_or_else(|| args.plan.clone());
    let suite = plan.into_suite(&config.shell);

    info!(
        "Running {} unit(s) from {} with concurrency {}",
        suite.units.len(),
        plan_name,
        config.concurrency
    );

    let mut console = ConsoleReporter::new(format).verbose(verbose);
    let mut formatter = ResultFormatter::new(format);
    if args.no_color {
        console = console.no_color();
        formatter = formatter.no_color();
    }
    let reporter = CompositeReporter::new()
        .with(Arc::new(console))
        .with(Arc::new(TracingReporter));

    let scheduler =
        Scheduler::from_config(&config, Arc::new(reporter)).with_hooks(suite.hooks);

    let cancel = scheduler.cancellation();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, letting running units finish");
            cancel.cancel();
        }
    });

    let summary = scheduler.run(suite.units).await?;
    interrupt.abort();

    println!("{}", formatter.format_summary(&summary));

    if let Some(output) = &args.output {
        write_results_to_file(output, &summary, format)?;
        println!("✓ Results written to: {output}");
    }

    let success = summary.is_success();

    if args.save {
        let run = StoredRun::new(plan_name, summary).with_config(RunConfig {
            concurrency: config.concurrency,
            default_timeout_secs: config.default_timeout_secs,
            filter: args.filter,
            tags: args.tag,
        });
        let path = results_storage(&config).save(&run)?;
        println!("✓ Run {} saved to: {}", run.id, path.display());
    }

    Ok(success)
}

fn list_units(args: cli::ListArgs) -> Result<()> {
    let plan = PlanFile::load(&args.plan)?;
    let name = plan.name.as_deref().unwrap_or(&args.plan);

    println!("\n{} ({} units)\n", name, plan.units.len());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    for unit in &plan.units {
        let marker = if unit.skip.is_some() { "⊘" } else { "•" };
        if unit.name.is_some() {
            println!("  {marker} {:30} {}", unit.key, unit.display_name());
        } else {
            println!("  {marker} {}", unit.key);
        }

        if !args.detailed {
            continue;
        }

        if !unit.depends_on.is_empty() {
            let deps: Vec<&str> = unit.depends_on.iter().map(|d| d.target()).collect();
            println!("      depends on: {}", deps.join(", "));
        }
        if unit.exclusive || !unit.constraint_keys.is_empty() {
            let scope = if unit.constraint_keys.is_empty() {
                "global".to_string()
            } else {
                unit.constraint_keys.join(", ")
            };
            let mode = if unit.exclusive { "exclusive" } else { "shared" };
            println!("      {mode}: {scope}");
        }
        if let Some(group) = &unit.group {
            match unit.group_limit {
                Some(limit) => println!("      group: {group} (max {limit})"),
                None => println!("      group: {group}"),
            }
        }
        if unit.retries > 0 {
            println!(
                "      retries: {} (delay {}ms{})",
                unit.retries,
                unit.retry_delay_ms,
                if unit.flaky { ", flaky" } else { "" }
            );
        }
        if let Some(timeout) = unit.timeout_secs {
            println!("      timeout: {timeout}s");
        }
        if let Some(reason) = &unit.skip {
            println!("      skipped: {reason}");
        }
        if !unit.tags.is_empty() {
            println!("      tags: {}", unit.tags.join(", "));
        }
        println!("      $ {}", unit.command);
    }

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");
    Ok(())
}

fn validate_plan(path: &str) -> Result<()> {
    let plan = load_plan(path)?;
    println!("✓ Plan is valid: {path} ({} units)", plan.units.len());
    Ok(())
}

fn show_results(args: cli::ResultsArgs, config: &SchedulerConfig) -> Result<()> {
    let storage = results_storage(config);

    let selected = match (&args.run, args.latest) {
        (Some(id), _) => Some(storage.load(id)?),
        (None, true) => storage.latest()?,
        (None, false) => None,
    };

    let Some(run) = selected else {
        let runs = storage.list_runs()?;
        if runs.is_empty() {
            println!("\n📭 No stored results in {}", storage.base_dir().display());
            println!("   Save a run with: test-scheduler run <plan> --save");
            return Ok(());
        }

        println!("\n┌──────────────────────────────────────────────────────────────────┐");
        println!("│ Stored Runs                                                      │");
        println!("├──────────────────────────────────────────────────────────────────┤");
        for info in &runs {
            println!(
                "│ {:20} │ {:19} │ {:3}/{:3} │ {:5.1}% │ {}",
                info.id,
                info.started_at.format("%Y-%m-%d %H:%M:%S"),
                info.passed,
                info.total,
                info.pass_rate,
                info.plan
            );
        }
        println!("└──────────────────────────────────────────────────────────────────┘");
        println!("\nUse --latest or --run <id> to view a run.\n");
        return Ok(());
    };

    let format = OutputFormat::from_str(&args.format)
        .ok_or_else(|| anyhow::anyhow!("Unknown output format: {}", args.format))?;

    if format == OutputFormat::Table {
        println!("\nRun {} ({})", run.id, run.plan);
        println!(
            "Started {} on {}/{}, concurrency {}",
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.environment.os,
            run.environment.arch,
            run.config.concurrency
        );
    }
    println!("{}", ResultFormatter::new(format).format_summary(&run.summary));

    if let Some(export) = &args.export {
        let path = PathBuf::from(export);
        let export_format = ExportFormat::from_extension(&path).unwrap_or(ExportFormat::Json);
        storage.export(&run, &path, export_format)?;
        println!("✓ Run exported to: {}", path.display());
    }

    Ok(())
}

fn manage_config(args: cli::ConfigArgs, explicit: Option<&str>, env: &EnvConfig) -> Result<()> {
    match args.action {
        cli::ConfigAction::Init { output, force } => {
            let path = Path::new(&output);
            if path.exists() && !force {
                anyhow::bail!(
                    "Configuration file already exists: {output}. Use --force to overwrite."
                );
            }

            ConfigFile::example().save(path)?;
            println!("✓ Configuration file created: {output}");
        }

        cli::ConfigAction::Show { format } => {
            let config = load_config(explicit, env)?;
            let output = if format == "json" {
                serde_json::to_string_pretty(&config)?
            } else {
                serde_yaml::to_string(&config)?
            };
            println!("{output}");
        }

        cli::ConfigAction::Validate { file } => {
            let path = file
                .or_else(|| explicit.map(str::to_string))
                .or_else(|| ConfigFile::find().map(|p| p.to_string_lossy().to_string()))
                .context("No configuration file given or found")?;

            match ConfigFile::load(expand_path(&path)) {
                Ok(_) => println!("✓ Configuration file is valid: {path}"),
                Err(e) => {
                    println!("✗ Configuration file is invalid: {path}");
                    println!("  Error: {e:#}");
                    return Err(e);
                }
            }
        }
    }

    Ok(())
}
