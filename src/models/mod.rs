//! Data models for test scheduling
//!
//! This module contains the test unit records handed to the scheduler and
//! the outcome types it produces.

mod outcome;
mod unit;

pub use outcome::{
    ExecutionRecord, OutcomeStatus, RunDiagnostic, RunSummary, TerminalOutcome, UnitReport,
    UnitResult,
};
pub use unit::{
    Dependency, HookSet, LifecycleBinding, ParallelPolicy, RetryPolicy, ScopeHooks, ScopeId,
    ScopeKind, SkipState, TestUnit, UnitKey,
};
