//! Results storage module
//!
//! Persists finished runs and exports them for later inspection.

mod storage;

pub use storage::{EnvironmentInfo, ExportFormat, ResultsStorage, RunConfig, RunInfo, StoredRun};
