//! Up-front plan validation
//!
//! The scheduler trusts its input; everything it cannot guard against
//! cheaply (cycles, dangling dependencies, inconsistent group limits) is
//! rejected here before a run starts.

use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

use super::PlanFile;
use crate::models::ScopeKind;

/// A problem found in a plan
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unit #{index} has an empty key")]
    EmptyKey { index: usize },

    #[error("duplicate unit key '{0}'")]
    DuplicateKey(String),

    #[error("unit '{unit}' has an empty command")]
    EmptyCommand { unit: String },

    #[error("unit '{unit}' depends on unknown unit '{target}'")]
    UnknownDependency { unit: String, target: String },

    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("group '{group}' declares conflicting limits {first} and {second}")]
    ConflictingGroupLimit {
        group: String,
        first: usize,
        second: usize,
    },

    #[error("group '{group}' has a limit of 0")]
    ZeroGroupLimit { group: String },

    #[error("unit '{unit}' has a timeout of 0 seconds")]
    ZeroTimeout { unit: String },

    #[error("scope '{name}' has kind {kind}; only container and group scopes can be declared")]
    InvalidScopeKind { name: String, kind: ScopeKind },

    #[error("scope {0} is declared more than once")]
    DuplicateScope(String),
}

/// Check a plan, returning every problem found
pub fn validate(plan: &PlanFile) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let mut seen = HashSet::new();
    for (index, unit) in plan.units.iter().enumerate() {
        if unit.key.trim().is_empty() {
            errors.push(ValidationError::EmptyKey { index });
        } else if !seen.insert(unit.key.as_str()) {
            errors.push(ValidationError::DuplicateKey(unit.key.clone()));
        }
        if unit.command.trim().is_empty() {
            errors.push(ValidationError::EmptyCommand {
                unit: unit.key.clone(),
            });
        }
        if unit.timeout_secs == Some(0) {
            errors.push(ValidationError::ZeroTimeout {
                unit: unit.key.clone(),
            });
        }
    }

    for unit in &plan.units {
        for dep in &unit.depends_on {
            if !seen.contains(dep.target()) {
                errors.push(ValidationError::UnknownDependency {
                    unit: unit.key.clone(),
                    target: dep.target().to_string(),
                });
            }
        }
    }

    errors.extend(find_cycles(plan).into_iter().map(ValidationError::Cycle));
    errors.extend(check_group_limits(plan));
    errors.extend(check_scopes(plan));

    errors
}

/// Dependency cycles, each as a closed path starting and ending on the same key
fn find_cycles(plan: &PlanFile) -> Vec<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnStack,
        Done,
    }

    let index: HashMap<&str, usize> = plan
        .units
        .iter()
        .enumerate()
        .map(|(i, u)| (u.key.as_str(), i))
        .collect();
    let edges: Vec<Vec<usize>> = plan
        .units
        .iter()
        .map(|u| {
            u.depends_on
                .iter()
                .filter_map(|d| index.get(d.target()).copied())
                .collect()
        })
        .collect();

    let mut marks = vec![Mark::Unvisited; plan.units.len()];
    let mut cycles = Vec::new();

    for root in 0..plan.units.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }

        // Iterative DFS: (node, next edge to follow)
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        marks[root] = Mark::OnStack;

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            let Some(&target) = edges[node].get(top.1) else {
                marks[node] = Mark::Done;
                stack.pop();
                continue;
            };
            top.1 += 1;

            match marks[target] {
                Mark::Unvisited => {
                    marks[target] = Mark::OnStack;
                    stack.push((target, 0));
                }
                Mark::OnStack => {
                    let start = stack.iter().position(|&(n, _)| n == target).unwrap_or(0);
                    let mut path: Vec<String> = stack[start..]
                        .iter()
                        .map(|&(n, _)| plan.units[n].key.clone())
                        .collect();
                    path.push(plan.units[target].key.clone());
                    cycles.push(path);
                }
                Mark::Done => {}
            }
        }
    }

    cycles
}

fn check_group_limits(plan: &PlanFile) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut limits: BTreeMap<&str, usize> = BTreeMap::new();

    for unit in &plan.units {
        let (Some(group), Some(limit)) = (unit.group.as_deref(), unit.group_limit) else {
            continue;
        };
        if limit == 0 {
            errors.push(ValidationError::ZeroGroupLimit {
                group: group.to_string(),
            });
            continue;
        }
        match limits.get(group) {
            Some(&first) if first != limit => {
                errors.push(ValidationError::ConflictingGroupLimit {
                    group: group.to_string(),
                    first,
                    second: limit,
                });
            }
            Some(_) => {}
            None => {
                limits.insert(group, limit);
            }
        }
    }

    errors
}

fn check_scopes(plan: &PlanFile) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for scope in &plan.scopes {
        if !matches!(scope.kind, ScopeKind::Container | ScopeKind::Group) {
            errors.push(ValidationError::InvalidScopeKind {
                name: scope.name.clone(),
                kind: scope.kind,
            });
        } else if !seen.insert(scope.id()) {
            errors.push(ValidationError::DuplicateScope(scope.id().to_string()));
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{DependencySpec, ScopeSpec, UnitSpec};

    fn unit(key: &str, deps: &[&str]) -> UnitSpec {
        UnitSpec {
            key: key.to_string(),
            command: "true".to_string(),
            depends_on: deps
                .iter()
                .map(|d| DependencySpec::Key(d.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    fn plan(units: Vec<UnitSpec>) -> PlanFile {
        PlanFile {
            units,
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_plan() {
        let plan = plan(vec![unit("a", &[]), unit("b", &["a"]), unit("c", &["a", "b"])]);
        assert!(validate(&plan).is_empty());
    }

    #[test]
    fn test_duplicate_and_unknown() {
        let plan = plan(vec![unit("a", &[]), unit("a", &[]), unit("b", &["ghost"])]);
        let errors = validate(&plan);
        assert!(errors.contains(&ValidationError::DuplicateKey("a".to_string())));
        assert!(errors.contains(&ValidationError::UnknownDependency {
            unit: "b".to_string(),
            target: "ghost".to_string(),
        }));
    }

    #[test]
    fn test_cycle_path() {
        let plan = plan(vec![
            unit("a", &["c"]),
            unit("b", &["a"]),
            unit("c", &["b"]),
            unit("d", &["a"]),
        ]);
        let errors = validate(&plan);
        assert_eq!(
            errors,
            vec![ValidationError::Cycle(vec![
                "a".to_string(),
                "c".to_string(),
                "b".to_string(),
                "a".to_string(),
            ])]
        );
        assert_eq!(errors[0].to_string(), "dependency cycle: a -> c -> b -> a");
    }

    #[test]
    fn test_self_dependency() {
        let errors = validate(&plan(vec![unit("a", &["a"])]));
        assert_eq!(
            errors,
            vec![ValidationError::Cycle(vec!["a".to_string(), "a".to_string()])]
        );
    }

    #[test]
    fn test_group_limits() {
        let mut a = unit("a", &[]);
        a.group = Some("io".to_string());
        a.group_limit = Some(2);
        let mut b = unit("b", &[]);
        b.group = Some("io".to_string());
        b.group_limit = Some(3);
        let mut c = unit("c", &[]);
        c.group = Some("net".to_string());
        c.group_limit = Some(0);

        let errors = validate(&plan(vec![a, b, c]));
        assert_eq!(
            errors,
            vec![
                ValidationError::ConflictingGroupLimit {
                    group: "io".to_string(),
                    first: 2,
                    second: 3,
                },
                ValidationError::ZeroGroupLimit {
                    group: "net".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_scope_kinds() {
        let mut plan = plan(vec![unit("a", &[])]);
        let scope = |kind, name: &str| ScopeSpec {
            kind,
            name: name.to_string(),
            before: Vec::new(),
            after: Vec::new(),
        };
        plan.scopes = vec![
            scope(ScopeKind::Container, "db"),
            scope(ScopeKind::Container, "db"),
            scope(ScopeKind::Unit, "x"),
        ];

        let errors = validate(&plan);
        assert_eq!(errors.len(), 2);
        assert_eq!(
            errors[0],
            ValidationError::DuplicateScope("container:db".to_string())
        );
        assert!(matches!(errors[1], ValidationError::InvalidScopeKind { .. }));
    }
}
