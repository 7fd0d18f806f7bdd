//! Scheduler errors

use thiserror::Error;

use crate::models::UnitKey;

/// Problems with a batch that prevent a run from starting
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("duplicate test unit key: {0}")]
    DuplicateKey(UnitKey),

    #[error("concurrency ceiling must be at least 1")]
    ZeroConcurrency,
}
