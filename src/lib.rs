//! Test Scheduler - dependency-aware, constraint-respecting test execution
//!
//! Takes a flat batch of independently discovered test units annotated with
//! scheduling metadata and produces one correct execution of them:
//!
//! - dependencies run first; a failed dependency skips its dependents
//!   unless they opted to proceed on failure
//! - exclusive units, shared constraint keys and parallel-group limits are
//!   honoured under a global concurrency ceiling
//! - container, group and session hooks run exactly once per scope
//! - retries, timeouts and cancellation are handled per unit
//! - every unit is reported exactly once, as soon as its outcome is known
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use test_scheduler::models::TestUnit;
//! use test_scheduler::scheduler::{action_fn, CollectingReporter, Scheduler};
//!
//! # async fn demo() -> Result<(), test_scheduler::scheduler::SchedulerError> {
//! let reporter = CollectingReporter::new();
//! let units = vec![
//!     TestUnit::new("setup", action_fn(|_| async { Ok(()) })),
//!     TestUnit::new("login", action_fn(|_| async { Ok(()) })).depends_on("setup"),
//! ];
//!
//! let summary = Scheduler::new(reporter.clone())
//!     .with_concurrency(4)
//!     .run(units)
//!     .await?;
//! assert!(summary.is_success());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod models;
pub mod output;
pub mod plan;
pub mod results;
pub mod scheduler;
pub mod utils;
