//! Scheduler core
//!
//! A fixed pool of worker tasks pulls admissible ready units in registry
//! order, runs them and feeds their outcomes back into the dependency
//! resolver until nothing is ready or running.

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::coordinator::{AdmissionTicket, ConstraintCoordinator};
use super::error::SchedulerError;
use super::lifecycle::LifecycleManager;
use super::reporter::{self, Reporter};
use super::resolver::{DependencyResolver, UPSTREAM_FAILED};
use super::runner::{ExecutionRunner, DEFAULT_CANCEL_GRACE};
use crate::config::{default_concurrency, SchedulerConfig};
use crate::models::{
    RunDiagnostic, RunSummary, ScopeHooks, TerminalOutcome, TestUnit, UnitReport, UnitResult,
};
use crate::utils::timer::Timer;

/// Reason given to units never started because the run was cancelled
pub const RUN_CANCELLED: &str = "run cancelled";

/// Reason given to units left waiting when no progress was possible
pub const UNRESOLVED: &str = "dependency cycle or unresolved dependency";

/// Scheduling phase of one unit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UnitPhase {
    Waiting,
    Ready,
    Running,
    Terminal,
}

/// Entry point: configure once, then [`Scheduler::run`] a batch
pub struct Scheduler {
    reporter: Arc<dyn Reporter>,
    max_concurrent: usize,
    default_timeout: Option<Duration>,
    cancel_grace: Duration,
    hooks: ScopeHooks,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(reporter: Arc<dyn Reporter>) -> Self {
        Self {
            reporter,
            max_concurrent: default_concurrency(),
            default_timeout: None,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            hooks: ScopeHooks::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Build from loaded configuration
    pub fn from_config(config: &SchedulerConfig, reporter: Arc<dyn Reporter>) -> Self {
        Self::new(reporter)
            .with_concurrency(config.concurrency)
            .with_default_timeout(config.default_timeout())
            .with_cancel_grace(config.cancel_grace())
    }

    /// Global concurrency ceiling
    pub fn with_concurrency(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Hook sets of the shared scopes referenced by the batch
    pub fn with_hooks(mut self, hooks: ScopeHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels the run when raised
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Execute `units` and report each exactly once.
    pub async fn run(&self, units: Vec<TestUnit>) -> Result<RunSummary, SchedulerError> {
        if self.max_concurrent == 0 {
            return Err(SchedulerError::ZeroConcurrency);
        }

        let timer = Timer::start("run");
        let units: Vec<Arc<TestUnit>> = units.into_iter().map(Arc::new).collect();
        let mut resolver = DependencyResolver::new(&units)?;

        if units.is_empty() {
            info!("No test units to run");
            return Ok(RunSummary::empty());
        }

        info!(
            "Starting run of {} units (max {} concurrent)",
            units.len(),
            self.max_concurrent
        );

        let mut phase = vec![UnitPhase::Waiting; units.len()];
        let mut ready = BTreeSet::new();
        for idx in resolver.mark_ready() {
            phase[idx] = UnitPhase::Ready;
            ready.insert(idx);
        }

        let run = Arc::new(Run {
            lifecycle: LifecycleManager::build(&units, &self.hooks),
            coordinator: ConstraintCoordinator::new(self.max_concurrent),
            runner: ExecutionRunner::new(self.cancel.clone())
                .with_default_timeout(self.default_timeout)
                .with_cancel_grace(self.cancel_grace),
            reporter: self.reporter.clone(),
            cancel: self.cancel.clone(),
            notify: Notify::new(),
            state: Mutex::new(RunState {
                resolver,
                phase,
                ready,
                in_flight: 0,
                finished: false,
                results: Vec::with_capacity(units.len()),
            }),
            units,
        });

        run.complete_preskipped().await;

        let workers = self.max_concurrent.min(run.units.len());
        let handles: Vec<_> = (0..workers)
            .map(|id| tokio::spawn(run.clone().worker(id)))
            .collect();
        for result in join_all(handles).await {
            if let Err(err) = result {
                error!("Worker task failed: {}", err);
            }
        }

        let diagnostic = run.sweep().await;
        if let Some(diagnostic) = &diagnostic {
            reporter::guarded("run_diagnostic", || run.reporter.run_diagnostic(diagnostic));
        }

        let results = std::mem::take(&mut run.state.lock().results);
        let summary = RunSummary::new(results, timer.stop().as_millis() as u64, diagnostic);

        info!(
            "Run completed in {}ms - Pass: {}/{} ({:.1}%)",
            summary.total_duration_ms,
            summary.passed,
            summary.total,
            summary.pass_rate()
        );

        Ok(summary)
    }
}

struct RunState {
    resolver: DependencyResolver,
    phase: Vec<UnitPhase>,
    /// Ready units by registry position
    ready: BTreeSet<usize>,
    /// Admitted units whose completion has not been fully settled
    in_flight: usize,
    /// Nothing ready or running remained
    finished: bool,
    results: Vec<UnitResult>,
}

enum Next {
    Run(usize, AdmissionTicket),
    Wait,
    Exit,
}

/// State shared by the workers of one run
struct Run {
    units: Vec<Arc<TestUnit>>,
    state: Mutex<RunState>,
    notify: Notify,
    coordinator: ConstraintCoordinator,
    lifecycle: LifecycleManager,
    runner: ExecutionRunner,
    reporter: Arc<dyn Reporter>,
    cancel: CancellationToken,
}

impl Run {
    async fn worker(self: Arc<Self>, id: usize) {
        trace!(worker = id, "worker started");
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.next() {
                Next::Run(idx, ticket) => self.execute(idx, ticket).await,
                Next::Wait => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = self.cancel.cancelled() => {}
                    }
                }
                Next::Exit => break,
            }
        }
        trace!(worker = id, "worker exiting");
    }

    /// Pick the first admissible ready unit, or decide to wait or exit.
    fn next(&self) -> Next {
        let mut state = self.state.lock();
        if state.finished || self.cancel.is_cancelled() {
            return Next::Exit;
        }

        let mut admitted = None;
        for &idx in &state.ready {
            let unit = &self.units[idx];
            match self.coordinator.try_admit(unit) {
                Ok(ticket) => {
                    admitted = Some((idx, ticket));
                    break;
                }
                Err(denied) => {
                    trace!(unit = %unit.key, %denied, "not admitted");
                    // Holds back later units so an exclusive unit cannot starve
                    if unit.parallel.is_globally_exclusive() {
                        break;
                    }
                }
            }
        }

        if let Some((idx, ticket)) = admitted {
            state.ready.remove(&idx);
            state.phase[idx] = UnitPhase::Running;
            state.in_flight += 1;
            return Next::Run(idx, ticket);
        }

        if state.in_flight == 0 && state.ready.is_empty() {
            state.finished = true;
            drop(state);
            self.notify.notify_waiters();
            return Next::Exit;
        }
        Next::Wait
    }

    async fn execute(&self, idx: usize, ticket: AdmissionTicket) {
        let _in_flight = InFlight(self);
        let unit = self.units[idx].clone();
        debug!(unit = %unit.key, "dispatching");
        reporter::guarded("unit_started", || self.reporter.unit_started(&unit));

        let report = match self.lifecycle.enter_scopes(&unit).await {
            Ok(()) => self.runner.run(&unit).await,
            Err(failure) => {
                warn!(unit = %unit.key, scope = %failure.scope, "scope setup failed, not running unit");
                UnitReport::synthetic(TerminalOutcome::errored(failure.to_string()))
            }
        };

        self.publish(idx, &report);
        self.lifecycle.exit_scopes_if_last(&unit).await;
        self.coordinator.release(ticket);
        self.notify.notify_waiters();

        self.settle(idx, report.outcome).await;
    }

    /// Record the terminal outcome and hand it to the reporter.
    /// Returns false if the unit was already terminal.
    fn publish(&self, idx: usize, report: &UnitReport) -> bool {
        let unit = &self.units[idx];
        {
            let mut state = self.state.lock();
            if state.phase[idx] == UnitPhase::Terminal {
                warn!(unit = %unit.key, "outcome already published, dropping duplicate");
                return false;
            }
            state.phase[idx] = UnitPhase::Terminal;
            state.ready.remove(&idx);
            state.results.push(UnitResult::from_report(unit, report));
        }
        reporter::publish(self.reporter.as_ref(), unit, report);
        true
    }

    /// Propagate a completion through the graph, skipping strict dependents
    /// of a non-passing unit transitively.
    async fn settle(&self, idx: usize, outcome: TerminalOutcome) {
        let mut queue = VecDeque::from([(idx, outcome)]);

        while let Some((done, outcome)) = queue.pop_front() {
            let (unblocked, skipped) = {
                let mut state = self.state.lock();
                let resolution = state.resolver.on_completed(done, &outcome);
                let mut unblocked = 0;
                for ready in resolution.ready {
                    if state.phase[ready] == UnitPhase::Waiting {
                        state.phase[ready] = UnitPhase::Ready;
                        state.ready.insert(ready);
                        unblocked += 1;
                    }
                }
                (unblocked, resolution.skipped)
            };

            if unblocked > 0 {
                self.notify.notify_waiters();
            }

            for dependent in skipped {
                let unit = self.units[dependent].clone();
                debug!(unit = %unit.key, upstream = %self.units[done].key, "skipping dependent");

                let report = UnitReport::skipped(UPSTREAM_FAILED);
                if self.publish(dependent, &report) {
                    self.lifecycle.exit_scopes_if_last(&unit).await;
                    queue.push_back((dependent, report.outcome));
                }
            }
        }
    }

    /// Report units marked skipped before scheduling, in registry order.
    async fn complete_preskipped(&self) {
        for (idx, unit) in self.units.iter().enumerate() {
            if !unit.skip.skipped {
                continue;
            }
            let reason = unit.skip.reason.as_deref().unwrap_or("skipped");
            debug!(unit = %unit.key, reason, "skipped before scheduling");

            let report = UnitReport::skipped(reason);
            if self.publish(idx, &report) {
                self.lifecycle.exit_scopes_if_last(unit).await;
                self.settle(idx, report.outcome).await;
            }
        }
    }

    /// Report every unit the workers left behind, once they have all exited.
    async fn sweep(&self) -> Option<RunDiagnostic> {
        let (remaining, natural_finish) = {
            let state = self.state.lock();
            let remaining: Vec<usize> = (0..self.units.len())
                .filter(|&i| state.phase[i] != UnitPhase::Terminal)
                .collect();
            (remaining, state.finished)
        };

        let cancelled = self.cancel.is_cancelled() && !natural_finish;
        if remaining.is_empty() && !cancelled {
            return None;
        }

        let reason = if cancelled { RUN_CANCELLED } else { UNRESOLVED };
        for &idx in &remaining {
            let unit = self.units[idx].clone();
            if self.publish(idx, &UnitReport::skipped(reason)) {
                self.lifecycle.exit_scopes_if_last(&unit).await;
            }
        }

        let diagnostic = if cancelled {
            RunDiagnostic::Cancelled {
                skipped: remaining.len(),
            }
        } else {
            RunDiagnostic::Stalled {
                unresolved: remaining.iter().map(|&i| self.units[i].key.clone()).collect(),
            }
        };
        error!("{}", diagnostic);
        Some(diagnostic)
    }
}

/// Counts an admitted unit as in flight until its worker is done with it,
/// including when the worker unwinds.
struct InFlight<'a>(&'a Run);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.0.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.0.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HookSet, RetryPolicy, ScopeId, UnitKey};
    use crate::scheduler::{action_fn, ActionError, CollectingReporter, ExecutionAction};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Tracks how many actions run at once
    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }

        /// Action holding the gauge for `ms` of (paused) time
        fn action(self: &Arc<Self>, ms: u64) -> Arc<dyn ExecutionAction> {
            let gauge = self.clone();
            action_fn(move |_| {
                let gauge = gauge.clone();
                async move {
                    let now = gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
                    gauge.peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    gauge.current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        }
    }

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn counting(calls: &Arc<AtomicUsize>) -> Arc<dyn ExecutionAction> {
        let calls = calls.clone();
        action_fn(move |_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn passing(key: &str) -> TestUnit {
        TestUnit::new(key, action_fn(|_| async { Ok(()) }))
    }

    fn failing(key: &str) -> TestUnit {
        TestUnit::new(key, action_fn(|_| async { Err(ActionError::failed("assertion failed")) }))
    }

    fn scheduler(reporter: &Arc<CollectingReporter>, concurrency: usize) -> Scheduler {
        Scheduler::new(reporter.clone()).with_concurrency(concurrency)
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let reporter = CollectingReporter::new();
        let summary = scheduler(&reporter, 4).run(Vec::new()).await.unwrap();

        assert_eq!(summary.total, 0);
        assert!(summary.is_success());
        assert!(reporter.events().is_empty());
    }

    #[tokio::test]
    async fn test_zero_concurrency_rejected() {
        let reporter = CollectingReporter::new();
        let result = scheduler(&reporter, 0).run(vec![passing("a")]).await;
        assert_eq!(result.unwrap_err(), SchedulerError::ZeroConcurrency);
    }

    #[tokio::test]
    async fn test_duplicate_keys_rejected() {
        let reporter = CollectingReporter::new();
        let result = scheduler(&reporter, 2)
            .run(vec![passing("a"), passing("a")])
            .await;
        assert_eq!(
            result.unwrap_err(),
            SchedulerError::DuplicateKey(UnitKey::new("a"))
        );
    }

    #[tokio::test]
    async fn test_strict_chain_cascades_skips() {
        let b_calls = counter();
        let c_calls = counter();
        let units = vec![
            failing("a"),
            TestUnit::new("b", counting(&b_calls)).depends_on("a"),
            TestUnit::new("c", counting(&c_calls)).depends_on("b"),
        ];

        let reporter = CollectingReporter::new();
        let summary = scheduler(&reporter, 4).run(units).await.unwrap();

        assert_eq!(
            reporter.terminal(),
            vec![
                (UnitKey::new("a"), TerminalOutcome::failed("assertion failed")),
                (UnitKey::new("b"), TerminalOutcome::skipped(UPSTREAM_FAILED)),
                (UnitKey::new("c"), TerminalOutcome::skipped(UPSTREAM_FAILED)),
            ]
        );
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
        assert_eq!(c_calls.load(Ordering::SeqCst), 0);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 2);
        assert!(!summary.is_success());
    }

    #[tokio::test]
    async fn test_proceed_on_failure_runs_dependent() {
        let calls = counter();
        let units = vec![
            failing("a"),
            TestUnit::new("b", counting(&calls)).depends_on_proceeding("a"),
        ];

        let reporter = CollectingReporter::new();
        scheduler(&reporter, 2).run(units).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(reporter.outcome("b"), Some(TerminalOutcome::Passed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependency_report_precedes_dispatch() {
        let gauge = Gauge::new();
        let units = vec![
            TestUnit::new("b", gauge.action(10)).depends_on("a"),
            TestUnit::new("a", gauge.action(50)),
            TestUnit::new("c", gauge.action(10)).depends_on("a").depends_on("b"),
        ];

        let reporter = CollectingReporter::new();
        scheduler(&reporter, 4).run(units).await.unwrap();

        let finished_a = reporter.position("a", false).unwrap();
        let started_b = reporter.position("b", true).unwrap();
        let finished_b = reporter.position("b", false).unwrap();
        let started_c = reporter.position("c", true).unwrap();
        assert!(finished_a < started_b);
        assert!(finished_b < started_c);
        assert_eq!(gauge.peak(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_ceiling_bounds_concurrency() {
        let gauge = Gauge::new();
        let units = (0..10)
            .map(|i| TestUnit::new(format!("u{i}"), gauge.action(20)))
            .collect();

        let reporter = CollectingReporter::new();
        let summary = scheduler(&reporter, 3).run(units).await.unwrap();

        assert_eq!(summary.passed, 10);
        assert_eq!(gauge.peak(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exclusive_units_never_overlap() {
        let gauge = Gauge::new();
        let units = (0..5)
            .map(|i| TestUnit::new(format!("x{i}"), gauge.action(10)).exclusive())
            .collect();

        let reporter = CollectingReporter::new();
        let summary = scheduler(&reporter, 2).run(units).await.unwrap();

        assert_eq!(summary.passed, 5);
        assert_eq!(gauge.peak(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exclusive_unit_runs_alone_among_others() {
        let gauge = Gauge::new();
        let mut units: Vec<TestUnit> = (0..3)
            .map(|i| TestUnit::new(format!("p{i}"), gauge.action(10)))
            .collect();
        units.insert(1, TestUnit::new("solo", gauge.action(10)).exclusive());

        let reporter = CollectingReporter::new();
        scheduler(&reporter, 4).run(units).await.unwrap();

        // No other event between the exclusive unit's start and its report
        let solo_start = reporter.position("solo", true).unwrap();
        let solo_end = reporter.position("solo", false).unwrap();
        assert_eq!(solo_end, solo_start + 1);
        for key in ["p0", "p1", "p2"] {
            assert_eq!(reporter.outcome(key), Some(TerminalOutcome::Passed));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_constraint_key_mutual_exclusion() {
        let shared = Gauge::new();
        let free = Gauge::new();
        let mut units: Vec<TestUnit> = (0..4)
            .map(|i| TestUnit::new(format!("db{i}"), shared.action(10)).constraint_key("db"))
            .collect();
        units.push(TestUnit::new("free", free.action(10)));

        let reporter = CollectingReporter::new();
        let summary = scheduler(&reporter, 4).run(units).await.unwrap();

        assert_eq!(summary.passed, 5);
        assert_eq!(shared.peak(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_limit_respected() {
        let gauge = Gauge::new();
        let units = (0..6)
            .map(|i| {
                TestUnit::new(format!("g{i}"), gauge.action(10)).in_parallel_group("io", Some(2))
            })
            .collect();

        let reporter = CollectingReporter::new();
        scheduler(&reporter, 6).run(units).await.unwrap();

        assert_eq!(gauge.peak(), 2);
    }

    #[tokio::test]
    async fn test_retry_then_pass() {
        let calls = counter();
        let action = {
            let calls = calls.clone();
            action_fn(move |_| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ActionError::failed("first attempt"))
                    } else {
                        Ok(())
                    }
                }
            })
        };
        let units = vec![TestUnit::new("r", action).with_retry(RetryPolicy::retries(3).flaky())];

        let reporter = CollectingReporter::new();
        let summary = scheduler(&reporter, 1).run(units).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let result = summary.result("r").unwrap();
        assert!(result.outcome.is_passed());
        assert_eq!(result.attempts, 2);
        assert!(result.flaky);
        assert_eq!(summary.flaky, 1);
        assert_eq!(reporter.report_count("r"), 1);
    }

    #[tokio::test]
    async fn test_container_hook_failure_errors_every_unit() {
        let calls = counter();
        let after = counter();
        let hooks = ScopeHooks::new().register(
            ScopeId::container("db"),
            HookSet::new()
                .before(action_fn(|_| async { Err(ActionError::errored("no database")) }))
                .after(counting(&after)),
        );
        let units = (0..4)
            .map(|i| TestUnit::new(format!("t{i}"), counting(&calls)).in_container("db"))
            .collect();

        let reporter = CollectingReporter::new();
        let summary = scheduler(&reporter, 2)
            .with_hooks(hooks)
            .run(units)
            .await
            .unwrap();

        assert_eq!(summary.errored, 4);
        for (_, outcome) in reporter.terminal() {
            assert!(matches!(
                outcome,
                TerminalOutcome::Errored { ref error } if error.contains("no database")
            ));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_hooks_run_once() {
        let before = counter();
        let after = counter();
        let gauge = Gauge::new();
        let hooks = ScopeHooks::new().session(
            HookSet::new()
                .before(counting(&before))
                .after(counting(&after)),
        );
        let units = (0..5)
            .map(|i| TestUnit::new(format!("s{i}"), gauge.action(5)).in_group_scope("Suite"))
            .collect();

        let reporter = CollectingReporter::new();
        scheduler(&reporter, 3)
            .with_hooks(hooks)
            .run(units)
            .await
            .unwrap();

        assert_eq!(before.load(Ordering::SeqCst), 1);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_preskipped_unit_reported_and_cascades() {
        let calls = counter();
        let units = vec![
            TestUnit::new("wip", counting(&calls)).skipped("not implemented"),
            TestUnit::new("next", counting(&calls)).depends_on("wip"),
            passing("other"),
        ];

        let reporter = CollectingReporter::new();
        let summary = scheduler(&reporter, 2).run(units).await.unwrap();

        assert_eq!(
            reporter.outcome("wip"),
            Some(TerminalOutcome::skipped("not implemented"))
        );
        assert_eq!(
            reporter.outcome("next"),
            Some(TerminalOutcome::skipped(UPSTREAM_FAILED))
        );
        assert_eq!(reporter.outcome("other"), Some(TerminalOutcome::Passed));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(summary.is_success());
    }

    #[tokio::test]
    async fn test_cancellation_skips_unstarted_units() {
        let cancel = CancellationToken::new();
        let trigger = {
            let cancel = cancel.clone();
            action_fn(move |_| {
                let cancel = cancel.clone();
                async move {
                    cancel.cancel();
                    Ok(())
                }
            })
        };
        let calls = counter();
        let units = vec![
            TestUnit::new("first", trigger),
            TestUnit::new("second", counting(&calls)),
            TestUnit::new("third", counting(&calls)).depends_on("second"),
        ];

        let reporter = CollectingReporter::new();
        let summary = scheduler(&reporter, 1)
            .with_cancellation(cancel)
            .run(units)
            .await
            .unwrap();

        assert_eq!(reporter.outcome("first"), Some(TerminalOutcome::Passed));
        assert_eq!(
            reporter.outcome("second"),
            Some(TerminalOutcome::skipped(RUN_CANCELLED))
        );
        assert_eq!(
            reporter.outcome("third"),
            Some(TerminalOutcome::skipped(RUN_CANCELLED))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            summary.diagnostic,
            Some(RunDiagnostic::Cancelled { skipped: 2 })
        );
        assert_eq!(reporter.diagnostics().len(), 1);
        assert!(!summary.is_success());
    }

    #[tokio::test]
    async fn test_cycle_reported_as_stall() {
        let units = vec![
            passing("a").depends_on("b"),
            passing("b").depends_on("a"),
            passing("c"),
        ];

        let reporter = CollectingReporter::new();
        let summary = scheduler(&reporter, 2).run(units).await.unwrap();

        assert_eq!(reporter.outcome("c"), Some(TerminalOutcome::Passed));
        assert_eq!(reporter.outcome("a"), Some(TerminalOutcome::skipped(UNRESOLVED)));
        assert_eq!(reporter.outcome("b"), Some(TerminalOutcome::skipped(UNRESOLVED)));
        assert_eq!(
            summary.diagnostic,
            Some(RunDiagnostic::Stalled {
                unresolved: vec![UnitKey::new("a"), UnitKey::new("b")],
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeout_applies() {
        let units = vec![
            TestUnit::new(
                "slow",
                action_fn(|_| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                }),
            ),
            TestUnit::new(
                "patient",
                action_fn(|_| async {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    Ok(())
                }),
            )
            .with_timeout(Duration::from_secs(10)),
        ];

        let reporter = CollectingReporter::new();
        scheduler(&reporter, 2)
            .with_default_timeout(Some(Duration::from_secs(2)))
            .with_cancel_grace(Duration::from_millis(100))
            .run(units)
            .await
            .unwrap();

        assert_eq!(
            reporter.outcome("slow"),
            Some(TerminalOutcome::failed(crate::scheduler::TIMEOUT_REASON))
        );
        assert_eq!(reporter.outcome("patient"), Some(TerminalOutcome::Passed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exactly_one_report_per_unit() {
        let mut units = Vec::new();
        for i in 0..20 {
            let unit = match i % 4 {
                0 => failing(&format!("u{i}")),
                1 => passing(&format!("u{i}")).depends_on(format!("u{}", i - 1)),
                2 => TestUnit::new(
                    format!("u{i}"),
                    action_fn(|ctx| async move {
                        if ctx.attempt == 1 {
                            panic!("unexpected state");
                        }
                        Ok(())
                    }),
                )
                .constraint_key("shared"),
                _ => passing(&format!("u{i}")).depends_on_proceeding(format!("u{}", i - 1)),
            };
            units.push(unit);
        }

        let reporter = CollectingReporter::new();
        let summary = scheduler(&reporter, 4).run(units).await.unwrap();

        assert_eq!(summary.total, 20);
        for i in 0..20 {
            assert_eq!(reporter.report_count(&format!("u{i}")), 1);
        }
        assert_eq!(summary.failed, 5);
        assert_eq!(summary.skipped, 5);
        assert_eq!(summary.errored, 5);
        assert_eq!(summary.passed, 5);
    }

    /// Forwards to a collector, except that failure reports blow up
    struct PanicOnFailure(Arc<CollectingReporter>);

    impl Reporter for PanicOnFailure {
        fn unit_started(&self, unit: &TestUnit) {
            self.0.unit_started(unit);
        }

        fn report_passed(&self, unit: &TestUnit, report: &UnitReport) {
            self.0.report_passed(unit, report);
        }

        fn report_failed(&self, _unit: &TestUnit, _reason: &str, _report: &UnitReport) {
            panic!("reporter bug");
        }

        fn report_errored(&self, unit: &TestUnit, error: &str, report: &UnitReport) {
            self.0.report_errored(unit, error, report);
        }

        fn report_skipped(&self, unit: &TestUnit, reason: &str) {
            self.0.report_skipped(unit, reason);
        }
    }

    #[tokio::test]
    async fn test_panicking_reporter_does_not_hang_run() {
        let collector = CollectingReporter::new();
        let units = vec![
            failing("a"),
            passing("b"),
            passing("c").depends_on("a"),
        ];

        let scheduler = Scheduler::new(Arc::new(PanicOnFailure(collector.clone())))
            .with_concurrency(2);
        let summary = tokio::time::timeout(Duration::from_secs(3), scheduler.run(units))
            .await
            .expect("run should finish despite the reporter panic")
            .unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(collector.outcome("b"), Some(TerminalOutcome::Passed));
        assert_eq!(
            collector.outcome("c"),
            Some(TerminalOutcome::skipped(UPSTREAM_FAILED))
        );
    }

    #[tokio::test]
    async fn test_session_after_hook_sees_last_report() {
        let reporter = CollectingReporter::new();
        let seen = Arc::new(Mutex::new(None));
        let after = {
            let reporter = reporter.clone();
            let seen = seen.clone();
            action_fn(move |_| {
                let reporter = reporter.clone();
                let seen = seen.clone();
                async move {
                    *seen.lock() = Some(reporter.terminal().len());
                    Ok(())
                }
            })
        };
        let hooks = ScopeHooks::new().session(HookSet::new().after(after));

        scheduler(&reporter, 1)
            .with_hooks(hooks)
            .run(vec![passing("only")])
            .await
            .unwrap();

        assert_eq!(*seen.lock(), Some(1));
    }

    #[tokio::test]
    async fn test_poisoned_group_under_healthy_container() {
        let calls = counter();
        let db_before = counter();
        let db_after = counter();
        let broken_after = counter();
        let hooks = ScopeHooks::new()
            .register(
                ScopeId::container("db"),
                HookSet::new()
                    .before(counting(&db_before))
                    .after(counting(&db_after)),
            )
            .register(
                ScopeId::group("Broken"),
                HookSet::new()
                    .before(action_fn(|_| async { Err(ActionError::errored("fixture missing")) }))
                    .after(counting(&broken_after)),
            );
        let units = vec![
            TestUnit::new("b0", counting(&calls))
                .in_container("db")
                .in_group_scope("Broken"),
            TestUnit::new("b1", counting(&calls))
                .in_container("db")
                .in_group_scope("Broken"),
            TestUnit::new("h0", counting(&calls))
                .in_container("db")
                .in_group_scope("Healthy"),
        ];

        let reporter = CollectingReporter::new();
        let summary = scheduler(&reporter, 2)
            .with_hooks(hooks)
            .run(units)
            .await
            .unwrap();

        assert_eq!(summary.errored, 2);
        assert_eq!(summary.passed, 1);
        for key in ["b0", "b1"] {
            assert!(matches!(
                reporter.outcome(key),
                Some(TerminalOutcome::Errored { ref error }) if error.contains("fixture missing")
            ));
        }
        assert_eq!(reporter.outcome("h0"), Some(TerminalOutcome::Passed));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(db_before.load(Ordering::SeqCst), 1);
        assert_eq!(db_after.load(Ordering::SeqCst), 1);
        assert_eq!(broken_after.load(Ordering::SeqCst), 1);
    }
}
