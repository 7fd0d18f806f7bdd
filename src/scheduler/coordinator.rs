//! Admission control
//!
//! Enforces exclusive units, constraint-key mutual exclusion, per-group
//! concurrency limits and the global concurrency ceiling. All lock and
//! semaphore state lives here; nothing else touches it.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use crate::models::{TestUnit, UnitKey};

/// Authorizes one unit to occupy a worker slot.
///
/// Every lock and slot it holds is returned when the ticket is dropped.
#[derive(Debug)]
#[must_use = "dropping an admission ticket releases it immediately"]
pub struct AdmissionTicket {
    key: UnitKey,
    exclusive: bool,
    constraint_keys: Vec<String>,
    locks: Arc<Mutex<KeyLocks>>,
    _group_slot: Option<OwnedSemaphorePermit>,
    _slot: OwnedSemaphorePermit,
}

impl AdmissionTicket {
    pub fn key(&self) -> &UnitKey {
        &self.key
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        for key in &self.constraint_keys {
            locks.held_keys.remove(key);
        }
        if self.exclusive {
            locks.exclusive_holder = None;
        }
        trace!(unit = %self.key, "released");
    }
}

/// Why a unit cannot start right now
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Denied {
    /// A must-run-alone unit is running
    ExclusiveRunning(UnitKey),
    /// This unit must run alone but others are running
    AwaitingIdle,
    /// Another running unit holds a shared constraint key
    KeyHeld { key: String, holder: UnitKey },
    /// The unit's parallel group is at its limit
    GroupFull { group: String, limit: usize },
    /// Global ceiling reached
    AtCapacity,
}

impl fmt::Display for Denied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denied::ExclusiveRunning(key) => write!(f, "exclusive unit {key} is running"),
            Denied::AwaitingIdle => write!(f, "waiting for all running units to finish"),
            Denied::KeyHeld { key, holder } => write!(f, "constraint key '{key}' held by {holder}"),
            Denied::GroupFull { group, limit } => {
                write!(f, "group '{group}' at its limit of {limit}")
            }
            Denied::AtCapacity => write!(f, "global concurrency ceiling reached"),
        }
    }
}

#[derive(Debug, Default)]
struct KeyLocks {
    exclusive_holder: Option<UnitKey>,
    held_keys: BTreeMap<String, UnitKey>,
    /// One counting semaphore per limited group, sized on first sight
    groups: HashMap<String, (Arc<Semaphore>, usize)>,
}

/// Grants admission tickets
#[derive(Debug)]
pub struct ConstraintCoordinator {
    max_concurrent: usize,
    slots: Arc<Semaphore>,
    locks: Arc<Mutex<KeyLocks>>,
}

impl ConstraintCoordinator {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            max_concurrent,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            locks: Arc::new(Mutex::new(KeyLocks::default())),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Units currently holding a ticket
    pub fn running(&self) -> usize {
        self.max_concurrent - self.slots.available_permits()
    }

    /// Admit `unit` if every constraint allows it; all-or-nothing.
    pub fn try_admit(&self, unit: &TestUnit) -> Result<AdmissionTicket, Denied> {
        // Checks and acquisitions happen under one guard so they are atomic
        let mut locks = self.locks.lock();
        let policy = &unit.parallel;

        if let Some(holder) = &locks.exclusive_holder {
            return Err(Denied::ExclusiveRunning(holder.clone()));
        }
        if policy.is_globally_exclusive() && self.running() > 0 {
            return Err(Denied::AwaitingIdle);
        }

        // constraint_keys is ordered, so keys are always examined lowest first
        for key in &policy.constraint_keys {
            if let Some(holder) = locks.held_keys.get(key) {
                return Err(Denied::KeyHeld {
                    key: key.clone(),
                    holder: holder.clone(),
                });
            }
        }

        let group_slot = match (&policy.group, policy.group_limit) {
            (Some(group), Some(limit)) => {
                let (semaphore, limit) = locks
                    .groups
                    .entry(group.clone())
                    .or_insert_with(|| {
                        let limit = limit.max(1);
                        (Arc::new(Semaphore::new(limit)), limit)
                    })
                    .clone();
                let permit = semaphore.try_acquire_owned().map_err(|_| Denied::GroupFull {
                    group: group.clone(),
                    limit,
                })?;
                Some(permit)
            }
            _ => None,
        };

        // A denial here drops the group permit taken above
        let slot = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| Denied::AtCapacity)?;

        for key in &policy.constraint_keys {
            locks.held_keys.insert(key.clone(), unit.key.clone());
        }
        if policy.is_globally_exclusive() {
            locks.exclusive_holder = Some(unit.key.clone());
        }

        trace!(unit = %unit.key, running = self.running(), "admitted");

        Ok(AdmissionTicket {
            key: unit.key.clone(),
            exclusive: policy.is_globally_exclusive(),
            constraint_keys: policy.constraint_keys.iter().cloned().collect(),
            locks: self.locks.clone(),
            _group_slot: group_slot,
            _slot: slot,
        })
    }

    /// Return every lock and slot held by `ticket`
    pub fn release(&self, ticket: AdmissionTicket) {
        drop(ticket);
    }
}
