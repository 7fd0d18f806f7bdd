//! Scope lifecycle management
//!
//! One [`ScopeHandle`] per shared scope observed in the batch, built before
//! scheduling starts. Before-hooks run once, on first entry; after-hooks run
//! once, when the last unit referencing the scope has finished.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::action::{invoke_guarded, ActionContext};
use crate::models::{HookSet, ScopeHooks, ScopeId, TestUnit};

/// Monotonic state of a scope
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeState {
    NotEntered,
    Entering,
    Active,
    Exiting,
    Exited,
}

/// A before-hook of a scope failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("before hook of {scope} failed: {message}")]
pub struct HookFailure {
    pub scope: ScopeId,
    pub message: String,
}

#[derive(Debug)]
struct HandleState {
    state: ScopeState,
    pending: usize,
    poisoned: bool,
}

/// Lifecycle accounting for one shared scope
pub struct ScopeHandle {
    id: ScopeId,
    hooks: HookSet,
    entry: OnceCell<Result<(), HookFailure>>,
    inner: Mutex<HandleState>,
}

impl ScopeHandle {
    fn new(id: ScopeId, hooks: HookSet, pending: usize) -> Self {
        Self {
            id,
            hooks,
            entry: OnceCell::new(),
            inner: Mutex::new(HandleState {
                state: ScopeState::NotEntered,
                pending,
                poisoned: false,
            }),
        }
    }

    pub fn id(&self) -> &ScopeId {
        &self.id
    }

    pub fn state(&self) -> ScopeState {
        self.inner.lock().state
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().pending
    }

    pub fn is_poisoned(&self) -> bool {
        self.inner.lock().poisoned
    }

    /// Enter the scope, running before-hooks if this is the first entry.
    /// Concurrent callers wait for that one-time transition only.
    async fn enter(&self) -> Result<(), HookFailure> {
        self.entry
            .get_or_init(|| async {
                self.inner.lock().state = ScopeState::Entering;
                debug!(scope = %self.id, hooks = self.hooks.before.len(), "entering scope");

                let mut result = Ok(());
                for (i, hook) in self.hooks.before.iter().enumerate() {
                    let ctx = ActionContext::new(self.id.name.clone(), 0);
                    if let Err(err) = invoke_guarded(hook.clone(), ctx).await {
                        warn!(scope = %self.id, hook = i, error = %err, "before hook failed, scope poisoned");
                        result = Err(HookFailure {
                            scope: self.id.clone(),
                            message: err.to_string(),
                        });
                        break;
                    }
                }

                let mut inner = self.inner.lock();
                inner.state = ScopeState::Active;
                inner.poisoned = result.is_err();
                result
            })
            .await
            .clone()
    }

    /// Drop one reference; the last one out runs the after-hooks.
    async fn release(&self) {
        let run_after_hooks = {
            let mut inner = self.inner.lock();
            inner.pending = inner.pending.saturating_sub(1);
            if inner.pending > 0 {
                false
            } else {
                match inner.state {
                    ScopeState::Active => {
                        inner.state = ScopeState::Exiting;
                        true
                    }
                    ScopeState::NotEntered => {
                        inner.state = ScopeState::Exited;
                        false
                    }
                    _ => false,
                }
            }
        };

        if !run_after_hooks {
            return;
        }

        debug!(scope = %self.id, hooks = self.hooks.after.len(), "exiting scope");
        for (i, hook) in self.hooks.after.iter().enumerate().rev() {
            let ctx = ActionContext::new(self.id.name.clone(), 0);
            if let Err(err) = invoke_guarded(hook.clone(), ctx).await {
                warn!(scope = %self.id, hook = i, error = %err, "after hook failed");
            }
        }
        self.inner.lock().state = ScopeState::Exited;
    }
}

/// Owns every [`ScopeHandle`] of a run
pub struct LifecycleManager {
    handles: HashMap<ScopeId, Arc<ScopeHandle>>,
}

impl LifecycleManager {
    /// Build one handle per scope referenced by `units`, counting references.
    pub fn build(units: &[Arc<TestUnit>], hooks: &ScopeHooks) -> Self {
        let mut counts: HashMap<ScopeId, usize> = HashMap::new();
        for unit in units {
            for scope in unit.lifecycle.scopes() {
                *counts.entry(scope).or_insert(0) += 1;
            }
        }

        let handles = counts
            .into_iter()
            .map(|(id, pending)| {
                let hook_set = hooks.get(&id).cloned().unwrap_or_default();
                let handle = Arc::new(ScopeHandle::new(id.clone(), hook_set, pending));
                (id, handle)
            })
            .collect::<HashMap<_, _>>();

        info!(scopes = handles.len(), "lifecycle scopes prepared");
        Self { handles }
    }

    pub fn handle(&self, id: &ScopeId) -> Option<&Arc<ScopeHandle>> {
        self.handles.get(id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Enter every shared scope of `unit`, outermost first.
    pub async fn enter_scopes(&self, unit: &TestUnit) -> Result<(), HookFailure> {
        for id in unit.lifecycle.scopes() {
            if let Some(handle) = self.handles.get(&id) {
                handle.enter().await?;
            }
        }
        Ok(())
    }

    /// Release `unit`'s references, innermost first, exiting scopes that
    /// have no pending units left.
    pub async fn exit_scopes_if_last(&self, unit: &TestUnit) {
        for id in unit.lifecycle.scopes().iter().rev() {
            if let Some(handle) = self.handles.get(id) {
                handle.release().await;
            }
        }
    }
}
