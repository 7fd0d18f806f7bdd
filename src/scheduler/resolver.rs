//! Dependency resolution
//!
//! Tracks, per unit, how many predecessors are still unresolved and decides
//! which units become ready or must be skipped when a unit completes.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::SchedulerError;
use crate::models::{TerminalOutcome, TestUnit, UnitKey};

/// Reason given to units whose strict predecessor did not pass
pub const UPSTREAM_FAILED: &str = "upstream dependency failed";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NodeStatus {
    Waiting,
    Ready,
    /// Decided to be skipped, completion not yet propagated
    Doomed,
    Terminal,
}

#[derive(Clone, Copy, Debug)]
struct Edge {
    dependent: usize,
    proceed_on_failure: bool,
}

/// Units unblocked by a completion
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Now ready to dispatch, registry order
    pub ready: Vec<usize>,
    /// Must be reported `Skipped(UPSTREAM_FAILED)`, registry order
    pub skipped: Vec<usize>,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.skipped.is_empty()
    }
}

/// Readiness bookkeeping over the dependency graph, indexed by registry position
#[derive(Debug)]
pub struct DependencyResolver {
    index: HashMap<UnitKey, usize>,
    dependents: Vec<Vec<Edge>>,
    remaining: Vec<usize>,
    status: Vec<NodeStatus>,
    preskipped: Vec<bool>,
}

impl DependencyResolver {
    /// Build the graph. Dependencies on keys outside the batch are ignored.
    pub fn new(units: &[Arc<TestUnit>]) -> Result<Self, SchedulerError> {
        let mut index = HashMap::with_capacity(units.len());
        for (i, unit) in units.iter().enumerate() {
            if index.insert(unit.key.clone(), i).is_some() {
                return Err(SchedulerError::DuplicateKey(unit.key.clone()));
            }
        }

        let mut dependents = vec![Vec::new(); units.len()];
        let mut remaining = vec![0; units.len()];

        for (i, unit) in units.iter().enumerate() {
            for dep in &unit.dependencies {
                match index.get(&dep.target) {
                    Some(&target) => {
                        dependents[target].push(Edge {
                            dependent: i,
                            proceed_on_failure: dep.proceed_on_failure,
                        });
                        remaining[i] += 1;
                    }
                    None => warn!(
                        unit = %unit.key,
                        target = %dep.target,
                        "dependency target is not part of this run, ignoring"
                    ),
                }
            }
        }

        Ok(Self {
            index,
            dependents,
            remaining,
            status: vec![NodeStatus::Waiting; units.len()],
            preskipped: units.iter().map(|u| u.skip.skipped).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.status.len()
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_empty()
    }

    pub fn index_of(&self, key: &UnitKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    /// Units with no predecessors, in registry order. Pre-skipped units are
    /// never returned; the scheduler completes them directly.
    pub fn mark_ready(&mut self) -> impl Iterator<Item = usize> {
        let mut ready = Vec::new();
        for i in 0..self.status.len() {
            if self.status[i] == NodeStatus::Waiting && self.remaining[i] == 0 && !self.preskipped[i]
            {
                self.status[i] = NodeStatus::Ready;
                ready.push(i);
            }
        }
        ready.into_iter()
    }

    /// Record a terminal outcome and return what it unblocks
    pub fn on_completed(&mut self, unit: usize, outcome: &TerminalOutcome) -> Resolution {
        let mut resolution = Resolution::default();
        if self.status[unit] == NodeStatus::Terminal {
            debug!(unit, "completion already recorded");
            return resolution;
        }
        self.status[unit] = NodeStatus::Terminal;

        let passed = outcome.is_passed();
        for edge in self.dependents[unit].clone() {
            let dependent = edge.dependent;
            if matches!(
                self.status[dependent],
                NodeStatus::Doomed | NodeStatus::Terminal
            ) {
                continue;
            }
            self.remaining[dependent] = self.remaining[dependent].saturating_sub(1);

            // A pre-skipped unit reports its own reason
            if self.preskipped[dependent] {
                continue;
            }

            if !passed && !edge.proceed_on_failure {
                self.status[dependent] = NodeStatus::Doomed;
                resolution.skipped.push(dependent);
            } else if self.remaining[dependent] == 0 && self.status[dependent] == NodeStatus::Waiting
            {
                self.status[dependent] = NodeStatus::Ready;
                resolution.ready.push(dependent);
            }
        }

        resolution.ready.sort_unstable();
        resolution.ready.dedup();
        resolution.skipped.sort_unstable();
        resolution.skipped.dedup();
        resolution
    }

    /// Units that are neither ready nor finished
    pub fn waiting(&self) -> Vec<usize> {
        (0..self.status.len())
            .filter(|&i| self.status[i] == NodeStatus::Waiting)
            .collect()
    }
}
