//! Test unit models
//!
//! Defines the schedulable unit of work and all of its scheduling metadata.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::scheduler::ExecutionAction;

/// Stable, globally unique identity of a test unit
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitKey(String);

impl UnitKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for UnitKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Parallelism constraints of a unit
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelPolicy {
    /// Must run alone (within its constraint keys, or system-wide when it has none)
    pub exclusive: bool,
    /// Named mutual-exclusion tokens
    pub constraint_keys: BTreeSet<String>,
    /// Parallel group the unit competes in
    pub group: Option<String>,
    /// Maximum concurrently running units of `group`
    pub group_limit: Option<usize>,
}

impl ParallelPolicy {
    /// Exclusive with no keys: nothing else may run alongside it.
    pub fn is_globally_exclusive(&self) -> bool {
        self.exclusive && self.constraint_keys.is_empty()
    }
}

/// Ordering edge to another unit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub target: UnitKey,
    /// Run even when `target` does not pass
    pub proceed_on_failure: bool,
}

impl Dependency {
    pub fn on(target: impl Into<UnitKey>) -> Self {
        Self {
            target: target.into(),
            proceed_on_failure: false,
        }
    }

    pub fn proceeding(target: impl Into<UnitKey>) -> Self {
        Self {
            target: target.into(),
            proceed_on_failure: true,
        }
    }
}

/// Retry behaviour of a unit
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first
    pub max_retries: u32,
    /// Pause between attempts
    pub delay: Duration,
    /// Annotate the final report as flaky
    pub flaky: bool,
}

impl RetryPolicy {
    pub fn retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn flaky(mut self) -> Self {
        self.flaky = true;
        self
    }

    /// Total number of attempts, never less than one
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1).max(1)
    }
}

/// Pre-scheduling skip marker
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipState {
    pub skipped: bool,
    pub reason: Option<String>,
}

/// Lifecycle scope kinds, ordered outermost first
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    /// Whole run
    Session,
    /// Outer logical grouping (module / assembly equivalent)
    Container,
    /// Inner logical grouping (declaring type equivalent)
    Group,
    /// A single attempt of a single unit
    Unit,
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKind::Session => write!(f, "session"),
            ScopeKind::Container => write!(f, "container"),
            ScopeKind::Group => write!(f, "group"),
            ScopeKind::Unit => write!(f, "unit"),
        }
    }
}

/// Identity of a shared lifecycle scope
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeId {
    pub kind: ScopeKind,
    pub name: String,
}

impl ScopeId {
    pub fn new(kind: ScopeKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn session() -> Self {
        Self::new(ScopeKind::Session, "session")
    }

    pub fn container(name: impl Into<String>) -> Self {
        Self::new(ScopeKind::Container, name)
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self::new(ScopeKind::Group, name)
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Before/after hooks of one scope, in declaration order
#[derive(Clone, Default)]
pub struct HookSet {
    pub before: Vec<Arc<dyn ExecutionAction>>,
    pub after: Vec<Arc<dyn ExecutionAction>>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before(mut self, hook: Arc<dyn ExecutionAction>) -> Self {
        self.before.push(hook);
        self
    }

    pub fn after(mut self, hook: Arc<dyn ExecutionAction>) -> Self {
        self.after.push(hook);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }
}

impl fmt::Debug for HookSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookSet")
            .field("before", &self.before.len())
            .field("after", &self.after.len())
            .finish()
    }
}

/// Registry of hook sets for shared scopes
#[derive(Clone, Debug, Default)]
pub struct ScopeHooks {
    hooks: HashMap<ScopeId, HookSet>,
}

impl ScopeHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the session-wide hooks
    pub fn session(self, hooks: HookSet) -> Self {
        self.register(ScopeId::session(), hooks)
    }

    pub fn register(mut self, scope: ScopeId, hooks: HookSet) -> Self {
        self.insert(scope, hooks);
        self
    }

    pub fn insert(&mut self, scope: ScopeId, hooks: HookSet) {
        self.hooks.insert(scope, hooks);
    }

    pub fn get(&self, scope: &ScopeId) -> Option<&HookSet> {
        self.hooks.get(scope)
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

/// Scopes a unit runs under, plus its own per-attempt hooks
#[derive(Clone, Debug, Default)]
pub struct LifecycleBinding {
    pub container: Option<String>,
    pub group: Option<String>,
    pub unit_hooks: HookSet,
}

impl LifecycleBinding {
    /// Shared scopes of the unit, outermost first. Every unit is in the session.
    pub fn scopes(&self) -> Vec<ScopeId> {
        let mut scopes = vec![ScopeId::session()];
        if let Some(container) = &self.container {
            scopes.push(ScopeId::container(container.clone()));
        }
        if let Some(group) = &self.group {
            scopes.push(ScopeId::group(group.clone()));
        }
        scopes
    }
}

/// A schedulable piece of work plus its scheduling metadata
#[derive(Clone)]
pub struct TestUnit {
    pub key: UnitKey,
    pub action: Arc<dyn ExecutionAction>,
    pub parallel: ParallelPolicy,
    pub dependencies: Vec<Dependency>,
    pub lifecycle: LifecycleBinding,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
    pub skip: SkipState,
    pub display_name: String,
    pub tags: Vec<String>,
}

impl TestUnit {
    pub fn new(key: impl Into<UnitKey>, action: Arc<dyn ExecutionAction>) -> Self {
        let key = key.into();
        Self {
            display_name: key.to_string(),
            key,
            action,
            parallel: ParallelPolicy::default(),
            dependencies: Vec::new(),
            lifecycle: LifecycleBinding::default(),
            retry: RetryPolicy::default(),
            timeout: None,
            skip: SkipState::default(),
            tags: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn depends_on(mut self, target: impl Into<UnitKey>) -> Self {
        self.dependencies.push(Dependency::on(target));
        self
    }

    pub fn depends_on_proceeding(mut self, target: impl Into<UnitKey>) -> Self {
        self.dependencies.push(Dependency::proceeding(target));
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.parallel.exclusive = true;
        self
    }

    pub fn constraint_key(mut self, key: impl Into<String>) -> Self {
        self.parallel.constraint_keys.insert(key.into());
        self
    }

    pub fn in_parallel_group(mut self, group: impl Into<String>, limit: Option<usize>) -> Self {
        self.parallel.group = Some(group.into());
        self.parallel.group_limit = limit;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn skipped(mut self, reason: impl Into<String>) -> Self {
        self.skip = SkipState {
            skipped: true,
            reason: Some(reason.into()),
        };
        self
    }

    pub fn in_container(mut self, name: impl Into<String>) -> Self {
        self.lifecycle.container = Some(name.into());
        self
    }

    pub fn in_group_scope(mut self, name: impl Into<String>) -> Self {
        self.lifecycle.group = Some(name.into());
        self
    }

    pub fn with_unit_hooks(mut self, hooks: HookSet) -> Self {
        self.lifecycle.unit_hooks = hooks;
        self
    }
}

impl fmt::Debug for TestUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestUnit")
            .field("key", &self.key)
            .field("display_name", &self.display_name)
            .field("parallel", &self.parallel)
            .field("dependencies", &self.dependencies)
            .field("lifecycle", &self.lifecycle)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("skip", &self.skip)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for TestUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.display_name == self.key.as_str() {
            write!(f, "{}", self.key)
        } else {
            write!(f, "{} ({})", self.display_name, self.key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::action_fn;

    fn noop() -> Arc<dyn ExecutionAction> {
        action_fn(|_| async { Ok(()) })
    }

    #[test]
    fn test_total_attempts() {
        assert_eq!(RetryPolicy::default().total_attempts(), 1);
        assert_eq!(RetryPolicy::retries(2).total_attempts(), 3);
        assert_eq!(RetryPolicy::retries(u32::MAX).total_attempts(), u32::MAX);
    }

    #[test]
    fn test_scopes_outermost_first() {
        let unit = TestUnit::new("a", noop())
            .in_container("db")
            .in_group_scope("UserTests");

        assert_eq!(
            unit.lifecycle.scopes(),
            vec![
                ScopeId::session(),
                ScopeId::container("db"),
                ScopeId::group("UserTests"),
            ]
        );
    }

    #[test]
    fn test_global_exclusivity() {
        let alone = TestUnit::new("a", noop()).exclusive();
        assert!(alone.parallel.is_globally_exclusive());

        let keyed = TestUnit::new("b", noop()).exclusive().constraint_key("db");
        assert!(!keyed.parallel.is_globally_exclusive());
    }

    #[test]
    fn test_unit_builder() {
        let unit = TestUnit::new("suite::login", noop())
            .with_name("Login")
            .depends_on("suite::setup")
            .depends_on_proceeding("suite::seed")
            .skipped("not ready");

        assert_eq!(unit.dependencies.len(), 2);
        assert!(!unit.dependencies[0].proceed_on_failure);
        assert!(unit.dependencies[1].proceed_on_failure);
        assert!(unit.skip.skipped);
        assert_eq!(unit.to_string(), "Login (suite::login)");
    }
}
