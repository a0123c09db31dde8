//! Error taxonomy for the dispatcher core.

use super::job::JobStatus;
use super::JobId;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    /// A persisted ledger entry could not be parsed
    #[error("Ledger {path} is corrupt at line {line}: {source}")]
    StoreCorrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// The ledger could not be read at all
    #[error("Failed to read ledger {path}: {source}")]
    LedgerRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Persisting the ledger failed
    #[error("Failed to persist ledger {path}: {source}")]
    LedgerWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another dispatcher already holds the ledger
    #[error("Ledger {0} is locked by another dispatcher")]
    LedgerLocked(PathBuf),

    #[error("Job {0} not found in ledger")]
    NotFound(JobId),

    #[error("Job {0} already exists in ledger")]
    DuplicateId(JobId),

    #[error("Job {id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// No GPU could be queried this cycle
    #[error("GPU telemetry unavailable: {0}")]
    ProbeUnavailable(String),

    #[error("Failed to launch job {id}: {reason}")]
    LaunchFailure { id: JobId, reason: String },
}

pub type DispatchResult<T> = Result<T, DispatchError>;

impl DispatchError {
    /// Whether the control loop must stop on this error.
    ///
    /// Probe and launch failures only affect one cycle or one job; everything
    /// else means the ledger can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            DispatchError::ProbeUnavailable(_) | DispatchError::LaunchFailure { .. }
        )
    }
}
