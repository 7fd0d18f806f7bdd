//! Execution actions
//!
//! The opaque unit of work behind a test unit or a lifecycle hook.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

/// Why an action did not succeed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// Expected, assertion-style failure
    #[error("{0}")]
    Failed(String),

    /// Unexpected error raised by the action
    #[error("{0}")]
    Errored(String),
}

impl ActionError {
    pub fn failed(reason: impl Into<String>) -> Self {
        ActionError::Failed(reason.into())
    }

    pub fn errored(error: impl Into<String>) -> Self {
        ActionError::Errored(error.into())
    }
}

impl From<anyhow::Error> for ActionError {
    fn from(err: anyhow::Error) -> Self {
        ActionError::Errored(format!("{err:#}"))
    }
}

pub type ActionResult = Result<(), ActionError>;

/// Shared buffer collecting an action's output
#[derive(Clone, Debug, Default)]
pub struct OutputBuffer(Arc<Mutex<String>>);

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, text: &str) {
        self.0.lock().push_str(text);
    }

    pub fn write_line(&self, line: &str) {
        let mut buf = self.0.lock();
        buf.push_str(line);
        buf.push('\n');
    }

    pub fn contents(&self) -> String {
        self.0.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// Per-invocation context handed to an action
#[derive(Clone, Debug)]
pub struct ActionContext {
    /// Unit key, or scope name for shared-scope hooks
    pub key: String,
    /// 1-based attempt number, 0 for shared-scope hooks
    pub attempt: u32,
    cancel: CancellationToken,
    output: OutputBuffer,
}

impl ActionContext {
    pub fn new(key: impl Into<String>, attempt: u32) -> Self {
        Self {
            key: key.into(),
            attempt,
            cancel: CancellationToken::new(),
            output: OutputBuffer::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_output(mut self, output: OutputBuffer) -> Self {
        self.output = output;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the scheduler asks this invocation to stop
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn output(&self) -> &OutputBuffer {
        &self.output
    }
}

/// Opaque, suspend-capable unit of work.
///
/// Implementations should observe [`ActionContext::cancelled`]; an action
/// that ignores it past its timeout keeps its worker slot until it returns.
#[async_trait]
pub trait ExecutionAction: Send + Sync {
    async fn invoke(&self, ctx: &ActionContext) -> ActionResult;
}

/// Adapter turning an async closure into an [`ExecutionAction`]
pub struct FnAction<F>(F);

#[async_trait]
impl<F, Fut> ExecutionAction for FnAction<F>
where
    F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    async fn invoke(&self, ctx: &ActionContext) -> ActionResult {
        (self.0)(ctx.clone()).await
    }
}

/// Wrap an async closure as a shareable action
pub fn action_fn<F, Fut>(f: F) -> Arc<dyn ExecutionAction>
where
    F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    Arc::new(FnAction(f))
}

/// Run an action on its own task so that a panic becomes an error
pub(crate) fn spawn_guarded(
    action: Arc<dyn ExecutionAction>,
    ctx: ActionContext,
) -> JoinHandle<ActionResult> {
    tokio::spawn(async move { action.invoke(&ctx).await })
}

/// Map a joined action task back to an action result
pub(crate) fn joined(result: Result<ActionResult, JoinError>) -> ActionResult {
    match result {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(ActionError::Errored(format!(
            "panicked: {}",
            panic_message(err.into_panic())
        ))),
        Err(_) => Err(ActionError::errored("action task was aborted")),
    }
}

/// Invoke an action to completion, capturing panics
pub(crate) async fn invoke_guarded(
    action: Arc<dyn ExecutionAction>,
    ctx: ActionContext,
) -> ActionResult {
    joined(spawn_guarded(action, ctx).await)
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
