use super::job::{JobRecord, JobStatus};
use super::{GpuId, JobId};
use serde::Serialize;
use std::collections::HashMap;

/// Read-only view of one job for status listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusRow {
    pub id: JobId,
    pub command: String,
    pub gpu: Option<GpuId>,
    pub status: JobStatus,
    /// Only present while the job is running
    pub pid: Option<u32>,
}

impl StatusRow {
    pub fn gpu_label(&self) -> String {
        self.gpu
            .map(|gpu| gpu.to_string())
            .unwrap_or_else(|| "none".to_string())
    }
}

impl From<&JobRecord> for StatusRow {
    fn from(record: &JobRecord) -> Self {
        Self {
            id: record.id,
            command: record.command.clone(),
            gpu: record.assigned_gpu,
            status: record.status(),
            pid: record.pid.filter(|_| record.is_running()),
        }
    }
}

pub fn rows(records: &[JobRecord]) -> Vec<StatusRow> {
    records.iter().map(StatusRow::from).collect()
}

pub fn counts_by_status(records: &[JobRecord]) -> HashMap<JobStatus, usize> {
    let mut counts = HashMap::new();
    for record in records {
        *counts.entry(record.status()).or_insert(0) += 1;
    }
    counts
}
