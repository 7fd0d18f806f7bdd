//! Test scheduling engine
//!
//! Turns a batch of [`TestUnit`](crate::models::TestUnit)s into one correct
//! execution: dependency ordering, admission control, scope lifecycles,
//! retries and timeouts, with outcomes streamed to a [`Reporter`].

mod action;
mod coordinator;
mod engine;
mod error;
mod lifecycle;
mod reporter;
mod resolver;
mod runner;

pub use action::{
    action_fn, ActionContext, ActionError, ActionResult, ExecutionAction, FnAction, OutputBuffer,
};
pub use coordinator::{AdmissionTicket, ConstraintCoordinator, Denied};
pub use engine::{Scheduler, RUN_CANCELLED, UNRESOLVED};
pub use error::SchedulerError;
pub use lifecycle::{HookFailure, LifecycleManager, ScopeHandle, ScopeState};
pub use reporter::{
    CollectingReporter, CompositeReporter, EventKind, ReportEvent, Reporter, TracingReporter,
};
pub use resolver::{DependencyResolver, Resolution, UPSTREAM_FAILED};
pub use runner::{ExecutionRunner, DEFAULT_CANCEL_GRACE, TIMEOUT_REASON};
