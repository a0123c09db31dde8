use super::error::{DispatchError, DispatchResult};
use super::{GpuId, JobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strum::{Display, EnumIter, EnumString};

#[derive(
    Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Hash, Display, EnumIter, EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum JobStatus {
    #[strum(to_string = "Pending")]
    Pending,
    #[strum(to_string = "Running")]
    Running,
    #[strum(to_string = "Completed")]
    Completed,
    #[strum(to_string = "Failed")]
    Failed,
}

impl JobStatus {
    /// Forward-only transition table.
    ///
    /// `Pending -> Failed` covers launch failures; nothing ever returns to `Pending`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Failed) | (Running, Completed) | (Running, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// One entry of a job's status history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: JobStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Where a job was ingested from: the commands file and the zero-based line index
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandOrigin {
    pub file: PathBuf,
    pub line: usize,
}

/// Persisted record for one submitted command.
///
/// `status` and `status_history` are only reachable through the transition
/// methods so a record can never skip or revisit a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub command: String,
    status: JobStatus,
    #[serde(default)]
    pub assigned_gpu: Option<GpuId>,
    #[serde(default)]
    pub pid: Option<u32>,
    /// Host the process was launched on
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub log_path: PathBuf,
    #[serde(default)]
    pub origin: Option<CommandOrigin>,
    #[serde(default)]
    status_history: Vec<StatusChange>,
}

impl JobRecord {
    pub fn new_pending(
        id: JobId,
        command: impl Into<String>,
        log_path: PathBuf,
        origin: Option<CommandOrigin>,
    ) -> Self {
        Self {
            id,
            command: command.into(),
            status: JobStatus::Pending,
            assigned_gpu: None,
            pid: None,
            host: None,
            started_at: None,
            ended_at: None,
            exit_code: None,
            log_path,
            origin,
            status_history: vec![StatusChange {
                status: JobStatus::Pending,
                at: Utc::now(),
                note: None,
            }],
        }
    }

    #[inline]
    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn history(&self) -> &[StatusChange] {
        &self.status_history
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }

    /// Move to `next`, appending a history entry. The record is untouched on error.
    pub fn transition(&mut self, next: JobStatus, note: Option<String>) -> DispatchResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DispatchError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(now);
        }
        self.status_history.push(StatusChange {
            status: next,
            at: now,
            note,
        });
        Ok(())
    }

    /// Record a successful launch on `gpu`.
    pub fn mark_running(
        &mut self,
        gpu: GpuId,
        pid: u32,
        host: Option<String>,
        note: Option<String>,
    ) -> DispatchResult<()> {
        self.transition(JobStatus::Running, note)?;
        self.assigned_gpu = Some(gpu);
        self.pid = Some(pid);
        self.host = host;
        self.started_at = self.status_history.last().map(|change| change.at);
        Ok(())
    }

    /// Record process exit. `None` means the exit status could not be observed.
    pub fn mark_exited(&mut self, exit_code: Option<i32>, note: Option<String>) -> DispatchResult<()> {
        let next = match exit_code {
            Some(0) => JobStatus::Completed,
            _ => JobStatus::Failed,
        };
        self.transition(next, note)?;
        self.exit_code = exit_code;
        Ok(())
    }

    pub fn mark_failed(&mut self, note: impl Into<String>) -> DispatchResult<()> {
        self.transition(JobStatus::Failed, Some(note.into()))
    }
}

/// Log file for a job: `<log_dir>/job_<id>.log`
pub fn log_path_for(log_dir: &Path, id: JobId) -> PathBuf {
    log_dir.join(format!("job_{id}.log"))
}
