//! Plan files
//!
//! A plan is a YAML or JSON suite file describing test units whose actions
//! are shell commands, plus the hooks of the scopes they share. Loading a
//! plan yields the `Vec<TestUnit>` and [`ScopeHooks`] the scheduler runs.

mod command;
mod validate;

pub use command::CommandAction;
pub use validate::{validate, ValidationError};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::is_yaml_file;
use crate::models::{
    Dependency, HookSet, RetryPolicy, ScopeHooks, ScopeId, ScopeKind, TestUnit, UnitKey,
};
use crate::scheduler::ExecutionAction;

/// Suite file root
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Working directory for commands, relative to the plan file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,

    /// Hooks around the whole run
    #[serde(default)]
    pub session: HookSpec,

    /// Hooks of container and group scopes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<ScopeSpec>,

    pub units: Vec<UnitSpec>,
}

/// Before/after commands of one scope
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub before: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
}

impl HookSpec {
    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }

    fn to_hooks(&self, commands: &CommandFactory) -> HookSet {
        let mut hooks = HookSet::new();
        for script in &self.before {
            hooks = hooks.before(commands.action(script));
        }
        for script in &self.after {
            hooks = hooks.after(commands.action(script));
        }
        hooks
    }
}

/// A named container or group scope
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScopeSpec {
    pub kind: ScopeKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub before: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
}

impl ScopeSpec {
    pub fn id(&self) -> ScopeId {
        ScopeId::new(self.kind, self.name.clone())
    }

    fn to_hooks(&self, commands: &CommandFactory) -> HookSet {
        HookSpec {
            before: self.before.clone(),
            after: self.after.clone(),
        }
        .to_hooks(commands)
    }
}

/// Dependency on another unit: a bare key, or a key with options
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencySpec {
    Key(String),
    Detailed {
        target: String,
        #[serde(default)]
        proceed_on_failure: bool,
    },
}

impl DependencySpec {
    pub fn target(&self) -> &str {
        match self {
            DependencySpec::Key(target) => target,
            DependencySpec::Detailed { target, .. } => target,
        }
    }

    fn to_dependency(&self) -> Dependency {
        match self {
            DependencySpec::Key(target) => Dependency::on(target.as_str()),
            DependencySpec::Detailed {
                target,
                proceed_on_failure: true,
            } => Dependency::proceeding(target.as_str()),
            DependencySpec::Detailed { target, .. } => Dependency::on(target.as_str()),
        }
    }
}

/// One test unit
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitSpec {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub command: String,

    #[serde(default)]
    pub exclusive: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraint_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_limit: Option<usize>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<DependencySpec>,

    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub flaky: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Skip reason; the unit is reported skipped without running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_scope: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub before_each: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after_each: Vec<String>,
}

impl UnitSpec {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.key)
    }

    fn matches(&self, filter: &UnitFilter) -> bool {
        let pattern_ok = filter
            .pattern
            .as_deref()
            .map(|p| self.key.contains(p) || self.display_name().contains(p))
            .unwrap_or(true);
        let tags_ok =
            filter.tags.is_empty() || filter.tags.iter().any(|tag| self.tags.contains(tag));
        pattern_ok && tags_ok
    }

    fn to_unit(&self, commands: &CommandFactory) -> TestUnit {
        let mut unit = TestUnit::new(self.key.as_str(), commands.action(&self.command))
            .with_name(self.display_name());
        unit.tags = self.tags.clone();

        unit.parallel.exclusive = self.exclusive;
        unit.parallel.constraint_keys = self.constraint_keys.iter().cloned().collect();
        unit.parallel.group = self.group.clone();
        unit.parallel.group_limit = self.group_limit;

        unit.dependencies = self.depends_on.iter().map(DependencySpec::to_dependency).collect();

        unit.retry = RetryPolicy {
            max_retries: self.retries,
            delay: Duration::from_millis(self.retry_delay_ms),
            flaky: self.flaky,
        };
        unit.timeout = self.timeout_secs.map(Duration::from_secs);

        if let Some(reason) = &self.skip {
            unit = unit.skipped(reason.clone());
        }

        unit.lifecycle.container = self.container.clone();
        unit.lifecycle.group = self.group_scope.clone();
        unit.lifecycle.unit_hooks = HookSpec {
            before: self.before_each.clone(),
            after: self.after_each.clone(),
        }
        .to_hooks(commands);

        unit
    }
}

/// Selects units by key/name substring and tags
#[derive(Clone, Debug, Default)]
pub struct UnitFilter {
    pub pattern: Option<String>,
    pub tags: Vec<String>,
}

impl UnitFilter {
    pub fn is_empty(&self) -> bool {
        self.pattern.is_none() && self.tags.is_empty()
    }
}

/// Units and hooks ready to hand to the scheduler
pub struct Suite {
    pub units: Vec<TestUnit>,
    pub hooks: ScopeHooks,
}

/// Builds command actions sharing one shell and working directory
struct CommandFactory {
    shell: String,
    workdir: Option<PathBuf>,
}

impl CommandFactory {
    fn action(&self, script: &str) -> Arc<dyn ExecutionAction> {
        let mut command = CommandAction::new(self.shell.clone(), script);
        if let Some(dir) = &self.workdir {
            command = command.workdir(dir.clone());
        }
        command.into_action()
    }
}

impl PlanFile {
    /// Load a plan from a YAML or JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;

        let mut plan = if is_yaml_file(path) {
            Self::from_yaml(&content)
                .with_context(|| format!("Failed to parse YAML plan: {}", path.display()))?
        } else {
            Self::from_json(&content)
                .with_context(|| format!("Failed to parse JSON plan: {}", path.display()))?
        };

        // Relative working directories are resolved against the plan's location
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        plan.workdir = Some(match plan.workdir.take() {
            Some(dir) if dir.is_relative() => base.join(dir),
            Some(dir) => dir,
            None => base.to_path_buf(),
        });

        debug!("Loaded plan {} with {} unit(s)", path.display(), plan.units.len());
        Ok(plan)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn unit(&self, key: &str) -> Option<&UnitSpec> {
        self.units.iter().find(|u| u.key == key)
    }

    /// Keep units matching `filter` together with everything they depend on
    pub fn filter(&self, filter: &UnitFilter) -> Self {
        if filter.is_empty() {
            return self.clone();
        }

        let by_key: HashMap<&str, &UnitSpec> =
            self.units.iter().map(|u| (u.key.as_str(), u)).collect();
        let mut keep: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<&str> = self
            .units
            .iter()
            .filter(|u| u.matches(filter))
            .map(|u| u.key.as_str())
            .collect();

        while let Some(key) = queue.pop_front() {
            if !keep.insert(key) {
                continue;
            }
            if let Some(unit) = by_key.get(key) {
                queue.extend(unit.depends_on.iter().map(DependencySpec::target));
            }
        }

        Self {
            units: self
                .units
                .iter()
                .filter(|u| keep.contains(u.key.as_str()))
                .cloned()
                .collect(),
            ..self.clone()
        }
    }

    /// Turn the plan into scheduler input, running commands through `shell`
    pub fn into_suite(self, shell: &str) -> Suite {
        let commands = CommandFactory {
            shell: shell.to_string(),
            workdir: self.workdir.clone(),
        };

        let mut hooks = ScopeHooks::new();
        if !self.session.is_empty() {
            hooks.insert(ScopeId::session(), self.session.to_hooks(&commands));
        }
        for scope in &self.scopes {
            hooks.insert(scope.id(), scope.to_hooks(&commands));
        }

        let units = self.units.iter().map(|u| u.to_unit(&commands)).collect();
        Suite { units, hooks }
    }

    /// Units in declaration order, by key
    pub fn keys(&self) -> Vec<UnitKey> {
        self.units.iter().map(|u| UnitKey::new(u.key.as_str())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PLAN: &str = r#"
name: demo
session:
  before: ["echo session-up"]
scopes:
  - kind: container
    name: db
    before: ["echo db-up"]
    after: ["echo db-down"]
units:
  - key: setup
    command: "true"
    tags: [smoke]
  - key: login
    name: Login works
    command: "echo login"
    depends_on:
      - setup
      - target: seed
        proceed_on_failure: true
    container: db
    retries: 2
    retry_delay_ms: 100
    flaky: true
    timeout_secs: 30
  - key: seed
    command: "true"
    exclusive: true
    constraint_keys: [database]
  - key: report
    command: "true"
    group: io
    group_limit: 2
    skip: not ready
"#;

    fn plan() -> PlanFile {
        PlanFile::from_yaml(PLAN).unwrap()
    }

    #[test]
    fn test_parse_plan() {
        let plan = plan();
        assert_eq!(plan.name.as_deref(), Some("demo"));
        assert_eq!(plan.units.len(), 4);
        assert_eq!(plan.scopes[0].kind, ScopeKind::Container);
        assert_eq!(plan.scopes[0].after, vec!["echo db-down".to_string()]);

        let login = plan.unit("login").unwrap();
        assert_eq!(login.display_name(), "Login works");
        assert_eq!(login.depends_on[0], DependencySpec::Key("setup".to_string()));
        assert_eq!(
            login.depends_on[1],
            DependencySpec::Detailed {
                target: "seed".to_string(),
                proceed_on_failure: true
            }
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = PlanFile::from_yaml("units:\n  - key: a\n    command: x\n    retires: 3\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_into_suite() {
        let suite = plan().into_suite("sh");
        assert_eq!(suite.units.len(), 4);
        assert!(suite.hooks.get(&ScopeId::session()).is_some());
        assert_eq!(
            suite
                .hooks
                .get(&ScopeId::container("db"))
                .map(|h| (h.before.len(), h.after.len())),
            Some((1, 1))
        );

        let login = &suite.units[1];
        assert_eq!(login.display_name, "Login works");
        assert_eq!(login.dependencies.len(), 2);
        assert!(login.dependencies[1].proceed_on_failure);
        assert_eq!(login.retry.total_attempts(), 3);
        assert!(login.retry.flaky);
        assert_eq!(login.retry.delay, Duration::from_millis(100));
        assert_eq!(login.timeout, Some(Duration::from_secs(30)));
        assert_eq!(login.lifecycle.container.as_deref(), Some("db"));

        let seed = &suite.units[2];
        assert!(seed.parallel.exclusive);
        assert!(!seed.parallel.is_globally_exclusive());

        let report = &suite.units[3];
        assert!(report.skip.skipped);
        assert_eq!(report.parallel.group_limit, Some(2));
    }

    #[test]
    fn test_filter_keeps_dependencies() {
        let plan = plan();
        let filtered = plan.filter(&UnitFilter {
            pattern: Some("login".to_string()),
            tags: Vec::new(),
        });
        let keys: Vec<&str> = filtered.units.iter().map(|u| u.key.as_str()).collect();
        assert_eq!(keys, vec!["setup", "login", "seed"]);
    }

    #[test]
    fn test_filter_by_tag() {
        let filtered = plan().filter(&UnitFilter {
            pattern: None,
            tags: vec!["smoke".to_string()],
        });
        assert_eq!(filtered.keys(), vec![UnitKey::new("setup")]);
    }

    #[test]
    fn test_load_resolves_workdir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(
            &path,
            r#"{"workdir": "fixtures", "units": [{"key": "a", "command": "true"}]}"#,
        )
        .unwrap();

        let plan = PlanFile::load(&path).unwrap();
        assert_eq!(plan.workdir, Some(dir.path().join("fixtures")));
    }
}
