//! Execution runner
//!
//! Runs a single unit to its terminal outcome: unit-scope hooks, timeout
//! enforcement and retries. Retries are local to the runner; callers see one
//! [`UnitReport`] per unit.

use chrono::Utc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::action::{
    invoke_guarded, joined, spawn_guarded, ActionContext, ActionError, ActionResult, OutputBuffer,
};
use crate::models::{ExecutionRecord, TerminalOutcome, TestUnit, UnitReport};
use crate::utils::timer::Timer;

/// Reason recorded when an attempt exceeds its budget
pub const TIMEOUT_REASON: &str = "timeout";

/// How long a timed-out action may take to honour cancellation
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Runs units one attempt at a time
#[derive(Clone, Debug)]
pub struct ExecutionRunner {
    default_timeout: Option<Duration>,
    cancel_grace: Duration,
    run_cancel: CancellationToken,
}

impl ExecutionRunner {
    pub fn new(run_cancel: CancellationToken) -> Self {
        Self {
            default_timeout: None,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            run_cancel,
        }
    }

    /// Timeout applied to units without their own
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Run `unit` until it passes or runs out of attempts
    pub async fn run(&self, unit: &TestUnit) -> UnitReport {
        let timer = Timer::start(unit.key.as_str());
        let total = unit.retry.total_attempts();
        let budget = unit.timeout.or(self.default_timeout);
        let mut records = Vec::new();

        for attempt in 1..=total {
            let record = self.attempt(unit, attempt, budget).await;
            let passed = record.outcome.is_passed();
            debug!(unit = %unit.key, attempt, outcome = %record.outcome, "attempt finished");
            records.push(record);

            if passed || attempt == total {
                break;
            }
            if self.run_cancel.is_cancelled() {
                info!(unit = %unit.key, attempt, "run cancelled, not retrying");
                break;
            }

            debug!(unit = %unit.key, next = attempt + 1, total, "retrying");
            if !unit.retry.delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(unit.retry.delay) => {}
                    _ = self.run_cancel.cancelled() => {
                        info!(unit = %unit.key, attempt, "run cancelled during retry delay");
                        break;
                    }
                }
            }
        }

        UnitReport::from_records(records, timer.stop(), unit.retry.flaky)
    }

    async fn attempt(
        &self,
        unit: &TestUnit,
        attempt: u32,
        budget: Option<Duration>,
    ) -> ExecutionRecord {
        let started_at = Utc::now();
        let output = OutputBuffer::new();
        let ctx = ActionContext::new(unit.key.as_str(), attempt)
            .with_cancellation(CancellationToken::new())
            .with_output(output.clone());

        let outcome = match self.before_hooks(unit, &ctx).await {
            Ok(()) => self.invoke(unit, ctx, budget).await,
            Err(err) => outcome_of(Err(err)),
        };
        self.after_hooks(unit, attempt, &output).await;

        ExecutionRecord::new(attempt, started_at, outcome, output.contents())
    }

    async fn invoke(
        &self,
        unit: &TestUnit,
        ctx: ActionContext,
        budget: Option<Duration>,
    ) -> TerminalOutcome {
        let cancel = ctx.cancellation().clone();
        let attempt = ctx.attempt;
        let mut handle = spawn_guarded(unit.action.clone(), ctx);

        let Some(budget) = budget else {
            return outcome_of(joined(handle.await));
        };

        match tokio::time::timeout(budget, &mut handle).await {
            Ok(result) => outcome_of(joined(result)),
            Err(_) => {
                warn!(
                    unit = %unit.key,
                    attempt,
                    budget_ms = budget.as_millis() as u64,
                    "attempt timed out, requesting cancellation"
                );
                cancel.cancel();

                if tokio::time::timeout(self.cancel_grace, &mut handle).await.is_err() {
                    warn!(
                        unit = %unit.key,
                        attempt,
                        grace_ms = self.cancel_grace.as_millis() as u64,
                        "action ignored cancellation, aborting its task"
                    );
                    handle.abort();
                    let _ = handle.await;
                }
                TerminalOutcome::failed(TIMEOUT_REASON)
            }
        }
    }

    async fn before_hooks(&self, unit: &TestUnit, ctx: &ActionContext) -> ActionResult {
        for hook in &unit.lifecycle.unit_hooks.before {
            if let Err(err) = invoke_guarded(hook.clone(), ctx.clone()).await {
                warn!(unit = %unit.key, attempt = ctx.attempt, error = %err, "unit before hook failed");
                return Err(ActionError::errored(format!("before hook failed: {err}")));
            }
        }
        Ok(())
    }

    async fn after_hooks(&self, unit: &TestUnit, attempt: u32, output: &OutputBuffer) {
        for hook in unit.lifecycle.unit_hooks.after.iter().rev() {
            let ctx = ActionContext::new(unit.key.as_str(), attempt).with_output(output.clone());
            if let Err(err) = invoke_guarded(hook.clone(), ctx).await {
                warn!(unit = %unit.key, attempt, error = %err, "unit after hook failed");
            }
        }
    }
}

fn outcome_of(result: ActionResult) -> TerminalOutcome {
    match result {
        Ok(()) => TerminalOutcome::Passed,
        Err(ActionError::Failed(reason)) => TerminalOutcome::failed(reason),
        Err(ActionError::Errored(error)) => TerminalOutcome::errored(error),
    }
}
