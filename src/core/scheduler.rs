use super::error::{DispatchError, DispatchResult};
use super::gpu::{FreeMemory, GpuProber, NvmlProber};
use super::job::{log_path_for, CommandOrigin, JobRecord, JobStatus};
use super::launcher::{hostname, LaunchRequest, Launcher, ProcessHandle, ProcessState, ShellLauncher};
use super::ledger::Ledger;
use super::source::{self, CommandFile};
use super::status::{self, StatusRow};
use super::{GpuId, JobId};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum::{Display, EnumString};

/// How many running jobs a GPU may host
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PlacementPolicy {
    /// One running job per GPU
    #[default]
    Exclusive,
    /// Several jobs per GPU while free memory allows; each placement reserves
    /// `min_free_mem_mb` on its GPU for the rest of the cycle
    Shared,
}

/// A decision to start `job_id` on `gpu`, with the free memory seen at that moment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub job_id: JobId,
    pub gpu: GpuId,
    pub free_mb: u64,
}

/// Match pending jobs to GPUs for one cycle.
///
/// Jobs are taken strictly in the given order. Each one gets the eligible GPU
/// with the most free memory (lowest id on ties). The first job that fits
/// nowhere ends the pass, so later jobs never overtake it.
pub fn plan_placements(
    pending: &[JobId],
    free: &FreeMemory,
    busy: &BTreeSet<GpuId>,
    min_free_mem_mb: u64,
    policy: PlacementPolicy,
) -> Vec<Placement> {
    let mut remaining: BTreeMap<GpuId, u64> = match policy {
        PlacementPolicy::Exclusive => free
            .iter()
            .filter(|(gpu, _)| !busy.contains(gpu))
            .map(|(&gpu, &mb)| (gpu, mb))
            .collect(),
        PlacementPolicy::Shared => free.clone(),
    };

    let mut placements = Vec::new();
    for &job_id in pending {
        let best = remaining
            .iter()
            .filter(|(_, &mb)| mb >= min_free_mem_mb)
            .max_by_key(|(&gpu, &mb)| (mb, Reverse(gpu)))
            .map(|(&gpu, &mb)| (gpu, mb));

        let Some((gpu, free_mb)) = best else {
            tracing::debug!(
                "Job {} waiting: no GPU with at least {}MB free",
                job_id,
                min_free_mem_mb
            );
            break;
        };

        placements.push(Placement {
            job_id,
            gpu,
            free_mb,
        });

        match policy {
            PlacementPolicy::Exclusive => {
                remaining.remove(&gpu);
            }
            PlacementPolicy::Shared => {
                if let Some(mb) = remaining.get_mut(&gpu) {
                    *mb = mb.saturating_sub(min_free_mem_mb);
                }
            }
        }
    }
    placements
}

enum Tracked {
    /// Launched by this dispatcher; exit status comes from the handle
    Child(Box<dyn ProcessHandle>),
    /// Still alive from a previous dispatcher run; only liveness is observable
    Adopted { pid: u32 },
}

struct RunningJob {
    gpu: GpuId,
    log_path: PathBuf,
    tracked: Tracked,
    /// Consecutive failed polls of a child handle
    poll_errors: u32,
}

/// Failed polls in a row before a child is tracked by liveness instead
const MAX_POLL_ERRORS: u32 = 3;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub adopted: Vec<JobId>,
    pub orphaned: Vec<JobId>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub finished: Vec<JobId>,
    pub ingested: usize,
    pub placed: Vec<Placement>,
    pub launch_failures: Vec<JobId>,
}

/// The dispatcher control loop and all of its mutable state
pub struct Scheduler {
    ledger: Ledger,
    prober: Box<dyn GpuProber>,
    launcher: Box<dyn Launcher>,
    gpu_ids: Vec<GpuId>,
    min_free_mem_mb: u64,
    policy: PlacementPolicy,
    log_dir: PathBuf,
    commands: Option<CommandFile>,
    host: Option<String>,
    running: BTreeMap<JobId, RunningJob>,
}

impl Scheduler {
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn gpu_ids(&self) -> &[GpuId] {
        &self.gpu_ids
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// GPUs held by running jobs
    pub fn busy_gpus(&self) -> BTreeSet<GpuId> {
        self.running.values().map(|job| job.gpu).collect()
    }

    /// Status listing of every job in the ledger
    pub fn snapshot(&self) -> Vec<StatusRow> {
        status::rows(self.ledger.records())
    }

    /// Reconcile `Running` records with live processes. Must run before the first cycle.
    ///
    /// Live processes on this host are adopted and keep their GPU. Everything
    /// else is failed as orphaned, which frees its GPU. Running it again is a no-op.
    pub fn recover(&mut self) -> DispatchResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let stale: Vec<JobRecord> = self
            .ledger
            .records()
            .iter()
            .filter(|r| r.is_running() && !self.running.contains_key(&r.id))
            .cloned()
            .collect();

        for record in stale {
            let same_host = match (&record.host, &self.host) {
                (Some(recorded), Some(current)) => recorded == current,
                _ => true,
            };
            let live_pid = record
                .pid
                .filter(|&pid| same_host && self.launcher.is_alive(pid));

            match (live_pid, record.assigned_gpu) {
                (Some(pid), Some(gpu)) => {
                    tracing::info!(
                        "Adopted job {} (pid {}) still running on GPU {}",
                        record.id,
                        pid,
                        gpu
                    );
                    self.running.insert(
                        record.id,
                        RunningJob {
                            gpu,
                            log_path: record.log_path.clone(),
                            tracked: Tracked::Adopted { pid },
                            poll_errors: 0,
                        },
                    );
                    report.adopted.push(record.id);
                }
                _ => {
                    let code = self.launcher.recorded_exit_code(&record.log_path);
                    let note = match code {
                        Some(code) => format!("orphaned on recovery (recorded exit code {code})"),
                        None => "orphaned on recovery".to_string(),
                    };
                    self.ledger.update(record.id, |job| {
                        job.mark_failed(note)?;
                        job.exit_code = code;
                        Ok(())
                    })?;
                    tracing::warn!(
                        "Job {} (pid {:?}) is no longer running; marked Failed and released GPU {:?}",
                        record.id,
                        record.pid,
                        record.assigned_gpu
                    );
                    report.orphaned.push(record.id);
                }
            }
        }

        Ok(report)
    }

    /// Ingest the commands file if it changed since the last call.
    pub fn ingest(&mut self) -> DispatchResult<usize> {
        let Some(commands) = self.commands.as_mut() else {
            return Ok(0);
        };
        let text = match commands.read_if_changed() {
            Ok(Some(text)) => text,
            Ok(None) => return Ok(0),
            Err(e) => {
                tracing::warn!(
                    "Failed to read commands file {}: {}",
                    commands.path().display(),
                    e
                );
                return Ok(0);
            }
        };
        let file = commands.path().to_path_buf();
        self.ingest_text(&file, &text)
    }

    /// Append a `Pending` record for every command in `text` not yet ingested
    /// from the same line of `file` with the same text.
    pub fn ingest_text(&mut self, file: &Path, text: &str) -> DispatchResult<usize> {
        let known: HashSet<(usize, String)> = self
            .ledger
            .records()
            .iter()
            .filter_map(|r| {
                r.origin
                    .as_ref()
                    .filter(|origin| origin.file == file)
                    .map(|origin| (origin.line, r.command.clone()))
            })
            .collect();

        let mut added = 0;
        for entry in source::parse(text) {
            if known.contains(&(entry.line, entry.command.to_string())) {
                continue;
            }
            let id = self.ledger.next_id();
            let origin = CommandOrigin {
                file: file.to_path_buf(),
                line: entry.line,
            };
            let record = JobRecord::new_pending(
                id,
                entry.command,
                log_path_for(&self.log_dir, id),
                Some(origin),
            );
            self.ledger.append(record)?;
            added += 1;
        }

        if added > 0 {
            tracing::info!("Queued {} new commands from {}", added, file.display());
        }
        Ok(added)
    }

    /// Record every running job whose process has exited and release its GPU.
    pub fn reap(&mut self) -> DispatchResult<Vec<JobId>> {
        let mut exited: Vec<(JobId, Option<i32>, Option<String>)> = Vec::new();

        for (&id, job) in self.running.iter_mut() {
            let mut unpollable = None;
            match &mut job.tracked {
                Tracked::Child(handle) => match handle.poll() {
                    Ok(ProcessState::Running) => job.poll_errors = 0,
                    Ok(ProcessState::Exited(code)) => {
                        let note = code.is_none().then(|| "terminated by signal".to_string());
                        exited.push((id, code, note));
                    }
                    Err(e) => {
                        job.poll_errors += 1;
                        tracing::warn!("Failed to poll job {} (pid {}): {}", id, handle.pid(), e);
                        if job.poll_errors >= MAX_POLL_ERRORS {
                            unpollable = Some(handle.pid());
                        }
                    }
                },
                Tracked::Adopted { pid } => {
                    if !self.launcher.is_alive(*pid) {
                        let code = self.launcher.recorded_exit_code(&job.log_path);
                        let note = code.is_none().then(|| "exit status unavailable".to_string());
                        exited.push((id, code, note));
                    }
                }
            }
            if let Some(pid) = unpollable {
                tracing::warn!(
                    "Job {} (pid {}) failed {} polls in a row; tracking it by liveness",
                    id,
                    pid,
                    job.poll_errors
                );
                job.tracked = Tracked::Adopted { pid };
            }
        }

        let mut finished = Vec::with_capacity(exited.len());
        for (id, code, note) in exited {
            let gpu = self.running.remove(&id).map(|job| job.gpu);
            let record = self.ledger.update(id, |job| job.mark_exited(code, note))?;
            tracing::info!(
                "Job {} {} (exit code {:?}), released GPU {:?}",
                id,
                record.status(),
                code,
                gpu
            );
            finished.push(id);
        }
        Ok(finished)
    }

    /// One full pass: reap, ingest, probe, place and launch.
    pub fn run_cycle(&mut self) -> DispatchResult<CycleReport> {
        let mut report = CycleReport {
            finished: self.reap()?,
            ingested: self.ingest()?,
            ..CycleReport::default()
        };
        self.place(&mut report)?;
        Ok(report)
    }

    fn place(&mut self, report: &mut CycleReport) -> DispatchResult<()> {
        let pending: Vec<JobId> = self
            .ledger
            .records()
            .iter()
            .filter(|r| r.status() == JobStatus::Pending)
            .map(|r| r.id)
            .collect();
        if pending.is_empty() {
            tracing::debug!("No pending jobs");
            return Ok(());
        }

        let free = match self.prober.query(&self.gpu_ids) {
            Ok(free) => free,
            Err(e) if !e.is_fatal() => {
                tracing::warn!("{}; skipping placement this cycle", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let placements = plan_placements(
            &pending,
            &free,
            &self.busy_gpus(),
            self.min_free_mem_mb,
            self.policy,
        );
        if placements.is_empty() {
            tracing::info!(
                "Unable to dispatch any of {} pending jobs; waiting",
                pending.len()
            );
        }

        for placement in placements {
            if self.launch(placement)? {
                report.placed.push(placement);
            } else {
                report.launch_failures.push(placement.job_id);
            }
        }
        Ok(())
    }

    /// Start one placed job. Returns `false` when the launch failed and the job
    /// was marked `Failed`.
    fn launch(&mut self, placement: Placement) -> DispatchResult<bool> {
        let Placement {
            job_id,
            gpu,
            free_mb,
        } = placement;
        let record = self
            .ledger
            .get(job_id)
            .ok_or(DispatchError::NotFound(job_id))?;
        let command = record.command.clone();
        let log_path = record.log_path.clone();

        let request = LaunchRequest {
            job_id,
            command: &command,
            gpu,
            log_path: &log_path,
        };

        match self.launcher.launch(&request) {
            Ok(handle) => {
                let pid = handle.pid();
                let host = self.host.clone();
                let note = format!("placed on GPU {gpu} with {free_mb}MB free");
                self.ledger
                    .update(job_id, |job| job.mark_running(gpu, pid, host, Some(note)))?;
                tracing::info!(
                    "Assigned job {} '{}' to GPU {} (free memory ~{}MB, pid {})",
                    job_id,
                    command,
                    gpu,
                    free_mb,
                    pid
                );
                self.running.insert(
                    job_id,
                    RunningJob {
                        gpu,
                        log_path,
                        tracked: Tracked::Child(handle),
                        poll_errors: 0,
                    },
                );
                Ok(true)
            }
            Err(e) => {
                let err = DispatchError::LaunchFailure {
                    id: job_id,
                    reason: format!("{e:#}"),
                };
                tracing::error!("{}", err);
                self.ledger
                    .update(job_id, |job| job.mark_failed(err.to_string()))?;
                Ok(false)
            }
        }
    }

    /// Run cycles every `poll_interval` until `shutdown` resolves or a fatal error occurs.
    ///
    /// Running jobs are left alone on shutdown.
    pub async fn run_until<F>(&mut self, poll_interval: Duration, shutdown: F) -> DispatchResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            "Starting job dispatch loop (GPUs {:?}, min free {}MB, {} placement, poll every {:?})",
            self.gpu_ids,
            self.min_free_mem_mb,
            self.policy,
            poll_interval
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(
                        "Shutting down dispatcher; {} running jobs left untouched",
                        self.running.len()
                    );
                    return Ok(());
                }
                _ = interval.tick() => {
                    let report = self.run_cycle()?;
                    tracing::debug!(
                        "Cycle done: {} finished, {} ingested, {} placed, {} launch failures",
                        report.finished.len(),
                        report.ingested,
                        report.placed.len(),
                        report.launch_failures.len()
                    );
                }
            }
        }
    }
}

/// Builder for [`Scheduler`] with injectable telemetry and process launching
pub struct SchedulerBuilder {
    prober: Option<Box<dyn GpuProber>>,
    launcher: Option<Box<dyn Launcher>>,
    gpu_ids: Vec<GpuId>,
    min_free_mem_mb: u64,
    policy: PlacementPolicy,
    log_dir: PathBuf,
    commands_file: Option<PathBuf>,
    host: Option<String>,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            prober: None,
            launcher: None,
            gpu_ids: Vec::new(),
            min_free_mem_mb: 6000,
            policy: PlacementPolicy::Exclusive,
            log_dir: PathBuf::from("logs"),
            commands_file: None,
            host: hostname(),
        }
    }

    pub fn with_prober(mut self, prober: Box<dyn GpuProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn with_launcher(mut self, launcher: Box<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_gpu_ids(mut self, gpu_ids: Vec<GpuId>) -> Self {
        self.gpu_ids = gpu_ids;
        self
    }

    pub fn with_min_free_mem_mb(mut self, mb: u64) -> Self {
        self.min_free_mem_mb = mb;
        self
    }

    pub fn with_policy(mut self, policy: PlacementPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_log_dir(mut self, log_dir: PathBuf) -> Self {
        self.log_dir = log_dir;
        self
    }

    pub fn with_commands_file(mut self, path: Option<PathBuf>) -> Self {
        self.commands_file = path;
        self
    }

    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.host = host;
        self
    }

    /// Defaults to NVML telemetry and the `sh -c` launcher.
    pub fn build(self, ledger: Ledger) -> Scheduler {
        Scheduler {
            ledger,
            prober: self
                .prober
                .unwrap_or_else(|| Box::new(NvmlProber::init())),
            launcher: self
                .launcher
                .unwrap_or_else(|| Box::new(ShellLauncher::new())),
            gpu_ids: self.gpu_ids,
            min_free_mem_mb: self.min_free_mem_mb,
            policy: self.policy,
            log_dir: self.log_dir,
            commands: self.commands_file.map(CommandFile::new),
            host: self.host,
            running: BTreeMap::new(),
        }
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    const HOST: &str = "node-a";
    const DEAD_PID: u32 = 2_000_000_000;

    /// Prober backed by a shared table tests can change between cycles
    #[derive(Clone, Default)]
    struct MockProber {
        free: Arc<Mutex<HashMap<GpuId, u64>>>,
    }

    impl MockProber {
        fn with(free: &[(GpuId, u64)]) -> Self {
            let prober = Self::default();
            prober.set(free);
            prober
        }

        fn set(&self, free: &[(GpuId, u64)]) {
            *self.free.lock().unwrap() = free.iter().copied().collect();
        }
    }

    impl GpuProber for MockProber {
        fn discover(&self) -> anyhow::Result<Vec<GpuId>> {
            Ok(self.free.lock().unwrap().keys().copied().collect())
        }

        fn free_memory_mb(&self, gpu: GpuId) -> anyhow::Result<u64> {
            self.free
                .lock()
                .unwrap()
                .get(&gpu)
                .copied()
                .ok_or_else(|| anyhow!("GPU {gpu} did not respond"))
        }
    }

    /// Launcher that records launches and lets tests decide when processes exit
    #[derive(Clone, Default)]
    struct MockLauncher {
        launched: Arc<Mutex<Vec<(JobId, GpuId)>>>,
        processes: Arc<Mutex<HashMap<u32, ProcessState>>>,
        alive: Arc<Mutex<HashSet<u32>>>,
        exit_files: Arc<Mutex<HashMap<PathBuf, i32>>>,
        failing_commands: Arc<Mutex<HashSet<String>>>,
        unpollable: Arc<Mutex<HashSet<u32>>>,
        next_pid: Arc<Mutex<u32>>,
    }

    impl MockLauncher {
        fn exit(&self, pid: u32, code: Option<i32>) {
            self.processes
                .lock()
                .unwrap()
                .insert(pid, ProcessState::Exited(code));
        }

        fn launched(&self) -> Vec<(JobId, GpuId)> {
            self.launched.lock().unwrap().clone()
        }
    }

    struct MockHandle {
        pid: u32,
        processes: Arc<Mutex<HashMap<u32, ProcessState>>>,
        unpollable: Arc<Mutex<HashSet<u32>>>,
    }

    impl ProcessHandle for MockHandle {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn poll(&mut self) -> std::io::Result<ProcessState> {
            if self.unpollable.lock().unwrap().contains(&self.pid) {
                return Err(std::io::Error::other("ECHILD"));
            }
            Ok(self
                .processes
                .lock()
                .unwrap()
                .get(&self.pid)
                .copied()
                .unwrap_or(ProcessState::Running))
        }
    }

    impl Launcher for MockLauncher {
        fn launch(&self, request: &LaunchRequest<'_>) -> anyhow::Result<Box<dyn ProcessHandle>> {
            if self.failing_commands.lock().unwrap().contains(request.command) {
                anyhow::bail!("No such file or directory");
            }
            let mut next_pid = self.next_pid.lock().unwrap();
            *next_pid += 1;
            let pid = 10_000 + *next_pid;
            self.launched
                .lock()
                .unwrap()
                .push((request.job_id, request.gpu));
            Ok(Box::new(MockHandle {
                pid,
                processes: self.processes.clone(),
                unpollable: self.unpollable.clone(),
            }))
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }

        fn recorded_exit_code(&self, log_path: &Path) -> Option<i32> {
            self.exit_files.lock().unwrap().get(log_path).copied()
        }
    }

    struct Harness {
        scheduler: Scheduler,
        prober: MockProber,
        launcher: MockLauncher,
        dir: TempDir,
    }

    impl Harness {
        fn ledger_path(&self) -> PathBuf {
            self.dir.path().join("jobs.jsonl")
        }

        fn status(&self, id: JobId) -> JobStatus {
            self.scheduler.ledger().get(id).unwrap().status()
        }
    }

    fn build(
        dir: TempDir,
        gpus: &[(GpuId, u64)],
        min_free_mem_mb: u64,
        policy: PlacementPolicy,
        launcher: MockLauncher,
    ) -> Harness {
        let prober = MockProber::with(gpus);
        let ledger = Ledger::open(dir.path().join("jobs.jsonl")).unwrap();
        let scheduler = SchedulerBuilder::new()
            .with_prober(Box::new(prober.clone()))
            .with_launcher(Box::new(launcher.clone()))
            .with_gpu_ids(gpus.iter().map(|&(gpu, _)| gpu).collect())
            .with_min_free_mem_mb(min_free_mem_mb)
            .with_policy(policy)
            .with_log_dir(dir.path().join("logs"))
            .with_host(Some(HOST.to_string()))
            .build(ledger);
        Harness {
            scheduler,
            prober,
            launcher,
            dir,
        }
    }

    fn harness(gpus: &[(GpuId, u64)], min_free_mem_mb: u64, commands: &str) -> Harness {
        let mut h = build(
            TempDir::new().unwrap(),
            gpus,
            min_free_mem_mb,
            PlacementPolicy::Exclusive,
            MockLauncher::default(),
        );
        let file = h.dir.path().join("commands.txt");
        h.scheduler.ingest_text(&file, commands).unwrap();
        h
    }

    #[test]
    fn test_first_cycle_places_only_on_eligible_gpu() {
        let mut h = harness(&[(0, 12000), (1, 4000)], 8000, "cmdA\n# skip\ncmdB\ncmdC\n");

        let report = h.scheduler.run_cycle().unwrap();
        assert_eq!(
            report.placed,
            vec![Placement {
                job_id: 1,
                gpu: 0,
                free_mb: 12000
            }]
        );
        assert_eq!(h.status(1), JobStatus::Running);
        assert_eq!(h.status(2), JobStatus::Pending);
        assert_eq!(h.status(3), JobStatus::Pending);

        let job = h.scheduler.ledger().get(1).unwrap();
        assert_eq!(job.assigned_gpu, Some(0));
        assert_eq!(job.host.as_deref(), Some(HOST));
        assert!(job.pid.is_some());
        assert!(job.started_at.is_some());
        assert_eq!(
            job.history().last().and_then(|c| c.note.as_deref()),
            Some("placed on GPU 0 with 12000MB free")
        );

        // GPU 0 is now occupied, GPU 1 still too small
        let report = h.scheduler.run_cycle().unwrap();
        assert!(report.placed.is_empty());
        assert_eq!(h.launcher.launched(), vec![(1, 0)]);
    }

    #[test]
    fn test_most_free_gpu_wins_and_ties_go_to_lowest_id() {
        let mut h = harness(&[(0, 9000), (1, 15000), (2, 15000)], 8000, "a\nb\nc\nd\n");
        h.scheduler.run_cycle().unwrap();
        assert_eq!(h.launcher.launched(), vec![(1, 1), (2, 2), (3, 0)]);
        assert_eq!(h.status(4), JobStatus::Pending);
    }

    #[test]
    fn test_exit_releases_gpu_for_next_job() {
        let mut h = harness(&[(0, 12000)], 8000, "cmdA\ncmdB\ncmdC\n");
        h.scheduler.run_cycle().unwrap();
        let pid_a = h.scheduler.ledger().get(1).unwrap().pid.unwrap();

        h.launcher.exit(pid_a, Some(0));
        let report = h.scheduler.run_cycle().unwrap();
        assert_eq!(report.finished, vec![1]);
        assert_eq!(h.status(1), JobStatus::Completed);
        assert_eq!(h.scheduler.ledger().get(1).unwrap().exit_code, Some(0));
        assert_eq!(report.placed.len(), 1);
        assert_eq!(report.placed[0].job_id, 2);
        assert_eq!(report.placed[0].gpu, 0);

        let pid_b = h.scheduler.ledger().get(2).unwrap().pid.unwrap();
        h.launcher.exit(pid_b, Some(1));
        h.scheduler.run_cycle().unwrap();
        assert_eq!(h.status(2), JobStatus::Failed);
        assert_eq!(h.status(3), JobStatus::Running);
    }

    #[test]
    fn test_signal_exit_is_failure() {
        let mut h = harness(&[(0, 12000)], 8000, "cmdA\n");
        h.scheduler.run_cycle().unwrap();
        let pid = h.scheduler.ledger().get(1).unwrap().pid.unwrap();
        h.launcher.exit(pid, None);
        h.scheduler.run_cycle().unwrap();

        let job = h.scheduler.ledger().get(1).unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(
            job.history().last().and_then(|c| c.note.as_deref()),
            Some("terminated by signal")
        );
    }

    #[test]
    fn test_launch_failure_fails_job_and_continues() {
        let mut h = harness(&[(0, 12000), (1, 11000)], 8000, "broken\ncmdB\n");
        h.launcher
            .failing_commands
            .lock()
            .unwrap()
            .insert("broken".to_string());

        let report = h.scheduler.run_cycle().unwrap();
        assert_eq!(report.launch_failures, vec![1]);
        assert_eq!(report.placed.len(), 1);
        assert_eq!(report.placed[0].job_id, 2);
        assert_eq!(report.placed[0].gpu, 1);

        let job = h.scheduler.ledger().get(1).unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.assigned_gpu.is_none());
        let statuses: Vec<_> = job.history().iter().map(|c| c.status).collect();
        assert_eq!(statuses, vec![JobStatus::Pending, JobStatus::Failed]);
        assert!(job
            .history()
            .last()
            .and_then(|c| c.note.as_deref())
            .is_some_and(|note| note.contains("No such file or directory")));

        // The GPU planned for the failed job is usable next cycle
        h.scheduler.ingest_text(Path::new("extra.txt"), "cmdC\n").unwrap();
        let report = h.scheduler.run_cycle().unwrap();
        assert_eq!(report.placed.len(), 1);
        assert_eq!(report.placed[0].gpu, 0);
    }

    #[test]
    fn test_probe_unavailable_skips_cycle() {
        let mut h = harness(&[(0, 12000)], 8000, "cmdA\n");
        h.prober.set(&[]);

        let report = h.scheduler.run_cycle().unwrap();
        assert!(report.placed.is_empty());
        assert_eq!(h.status(1), JobStatus::Pending);

        h.prober.set(&[(0, 12000)]);
        let report = h.scheduler.run_cycle().unwrap();
        assert_eq!(report.placed.len(), 1);
    }

    #[test]
    fn test_partial_probe_uses_responding_devices() {
        let mut h = harness(&[(0, 20000), (1, 20000)], 8000, "cmdA\ncmdB\n");
        h.prober.set(&[(1, 20000)]);
        let report = h.scheduler.run_cycle().unwrap();
        assert_eq!(report.placed.len(), 1);
        assert_eq!(report.placed[0].gpu, 1);
        assert_eq!(h.status(2), JobStatus::Pending);
    }

    #[test]
    fn test_shared_policy_reserves_threshold_per_placement() {
        let dir = TempDir::new().unwrap();
        let mut h = build(
            dir,
            &[(0, 20000), (1, 9000)],
            8000,
            PlacementPolicy::Shared,
            MockLauncher::default(),
        );
        h.scheduler
            .ingest_text(Path::new("c.txt"), "a\nb\nc\nd\n")
            .unwrap();

        let report = h.scheduler.run_cycle().unwrap();
        let placed: Vec<_> = report.placed.iter().map(|p| (p.job_id, p.gpu, p.free_mb)).collect();
        // 20000 -> a, 12000 -> b, then GPU 1 (9000) beats GPU 0 (4000)
        assert_eq!(placed, vec![(1, 0, 20000), (2, 0, 12000), (3, 1, 9000)]);
        assert_eq!(h.status(4), JobStatus::Pending);
    }

    #[test]
    fn test_restart_fails_orphans_and_reuses_gpu() {
        let dir = TempDir::new().unwrap();
        let ledger_path = dir.path().join("jobs.jsonl");
        {
            let mut ledger = Ledger::open(&ledger_path).unwrap();
            for (id, cmd) in [(1, "cmdA"), (2, "cmdB")] {
                let record = JobRecord::new_pending(id, cmd, log_path_for(dir.path(), id), None);
                ledger.append(record).unwrap();
            }
            ledger
                .update(1, |job| {
                    job.mark_running(0, DEAD_PID, Some(HOST.to_string()), None)
                })
                .unwrap();
        }

        let mut h = build(
            dir,
            &[(0, 12000), (1, 4000)],
            8000,
            PlacementPolicy::Exclusive,
            MockLauncher::default(),
        );
        let report = h.scheduler.recover().unwrap();
        assert_eq!(report.orphaned, vec![1]);
        assert!(report.adopted.is_empty());
        assert_eq!(h.status(1), JobStatus::Failed);
        assert_eq!(
            h.scheduler
                .ledger()
                .get(1)
                .unwrap()
                .history()
                .last()
                .and_then(|c| c.note.as_deref()),
            Some("orphaned on recovery")
        );
        assert!(h.scheduler.busy_gpus().is_empty());

        // Recovery again is a no-op
        let before = std::fs::read_to_string(h.ledger_path()).unwrap();
        assert_eq!(h.scheduler.recover().unwrap(), RecoveryReport::default());
        assert_eq!(std::fs::read_to_string(h.ledger_path()).unwrap(), before);

        let cycle = h.scheduler.run_cycle().unwrap();
        assert_eq!(cycle.placed.len(), 1);
        assert_eq!(cycle.placed[0].job_id, 2);
        assert_eq!(cycle.placed[0].gpu, 0);
    }

    #[test]
    fn test_recovery_adopts_live_process() {
        let dir = TempDir::new().unwrap();
        let ledger_path = dir.path().join("jobs.jsonl");
        let live_pid = 4321;
        let log_a = log_path_for(dir.path(), 1);
        {
            let mut ledger = Ledger::open(&ledger_path).unwrap();
            ledger
                .append(JobRecord::new_pending(1, "cmdA", log_a.clone(), None))
                .unwrap();
            ledger
                .append(JobRecord::new_pending(2, "cmdB", log_path_for(dir.path(), 2), None))
                .unwrap();
            ledger
                .update(1, |job| job.mark_running(0, live_pid, Some(HOST.to_string()), None))
                .unwrap();
        }

        let launcher = MockLauncher::default();
        launcher.alive.lock().unwrap().insert(live_pid);
        let mut h = build(
            dir,
            &[(0, 12000)],
            8000,
            PlacementPolicy::Exclusive,
            launcher,
        );

        let report = h.scheduler.recover().unwrap();
        assert_eq!(report.adopted, vec![1]);
        assert_eq!(h.status(1), JobStatus::Running);
        assert_eq!(h.scheduler.busy_gpus(), BTreeSet::from([0]));
        assert_eq!(h.scheduler.recover().unwrap(), RecoveryReport::default());

        // GPU 0 stays exclusive to the adopted job
        let cycle = h.scheduler.run_cycle().unwrap();
        assert!(cycle.placed.is_empty());

        // Adopted process exits; its recorded exit code decides the outcome
        h.launcher.alive.lock().unwrap().remove(&live_pid);
        h.launcher.exit_files.lock().unwrap().insert(log_a, 0);
        let cycle = h.scheduler.run_cycle().unwrap();
        assert_eq!(cycle.finished, vec![1]);
        assert_eq!(h.status(1), JobStatus::Completed);
        assert_eq!(cycle.placed.len(), 1);
        assert_eq!(cycle.placed[0].job_id, 2);
    }

    #[test]
    fn test_adopted_exit_without_status_fails() {
        let dir = TempDir::new().unwrap();
        {
            let mut ledger = Ledger::open(dir.path().join("jobs.jsonl")).unwrap();
            ledger
                .append(JobRecord::new_pending(1, "cmdA", log_path_for(dir.path(), 1), None))
                .unwrap();
            ledger
                .update(1, |job| job.mark_running(0, 77, None, None))
                .unwrap();
        }
        let launcher = MockLauncher::default();
        launcher.alive.lock().unwrap().insert(77);
        let mut h = build(dir, &[(0, 12000)], 8000, PlacementPolicy::Exclusive, launcher);
        assert_eq!(h.scheduler.recover().unwrap().adopted, vec![1]);

        h.launcher.alive.lock().unwrap().clear();
        h.scheduler.run_cycle().unwrap();
        let job = h.scheduler.ledger().get(1).unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(
            job.history().last().and_then(|c| c.note.as_deref()),
            Some("exit status unavailable")
        );
    }

    #[test]
    fn test_pid_from_other_host_is_orphaned() {
        let dir = TempDir::new().unwrap();
        {
            let mut ledger = Ledger::open(dir.path().join("jobs.jsonl")).unwrap();
            ledger
                .append(JobRecord::new_pending(1, "cmdA", log_path_for(dir.path(), 1), None))
                .unwrap();
            ledger
                .update(1, |job| job.mark_running(0, 55, Some("node-b".into()), None))
                .unwrap();
        }
        let launcher = MockLauncher::default();
        launcher.alive.lock().unwrap().insert(55);
        let mut h = build(dir, &[(0, 12000)], 8000, PlacementPolicy::Exclusive, launcher);
        assert_eq!(h.scheduler.recover().unwrap().orphaned, vec![1]);
    }

    #[test]
    fn test_ingest_dedupes_by_line_and_text() {
        let mut h = harness(&[(0, 12000)], 8000, "train\ntrain\n# c\neval\n");
        assert_eq!(h.scheduler.ledger().records().len(), 3);

        let file = h.dir.path().join("commands.txt");
        assert_eq!(
            h.scheduler
                .ingest_text(&file, "train\ntrain\n# c\neval\n")
                .unwrap(),
            0
        );
        // Appended line and an edited line are new jobs
        assert_eq!(
            h.scheduler
                .ingest_text(&file, "train\ntrain\n# c\neval --full\nexport\n")
                .unwrap(),
            2
        );
        // Same text from a different file is distinct
        assert_eq!(
            h.scheduler
                .ingest_text(Path::new("/other/commands.txt"), "train\n")
                .unwrap(),
            1
        );

        let records = h.scheduler.ledger().records();
        let ids: Vec<_> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
        let logs: HashSet<_> = records.iter().map(|r| r.log_path.clone()).collect();
        assert_eq!(logs.len(), records.len());
    }

    #[test]
    fn test_ingest_from_commands_file_survives_restart() {
        let dir = TempDir::new().unwrap();
        let commands = dir.path().join("commands.txt");
        std::fs::write(&commands, "cmdA\ncmdB\n").unwrap();
        let ledger_path = dir.path().join("jobs.jsonl");

        for _ in 0..2 {
            let ledger = Ledger::open(&ledger_path).unwrap();
            let mut scheduler = SchedulerBuilder::new()
                .with_prober(Box::new(MockProber::default()))
                .with_launcher(Box::new(MockLauncher::default()))
                .with_commands_file(Some(commands.clone()))
                .with_log_dir(dir.path().join("logs"))
                .build(ledger);
            scheduler.ingest().unwrap();
            assert_eq!(scheduler.ingest().unwrap(), 0);
        }

        let records = Ledger::load(&ledger_path).unwrap();
        let commands: Vec<_> = records.iter().map(|r| r.command.as_str()).collect();
        assert_eq!(commands, vec!["cmdA", "cmdB"]);
    }

    #[test]
    fn test_snapshot_reports_running_pid() {
        let mut h = harness(&[(0, 12000)], 8000, "cmdA\ncmdB\n");
        h.scheduler.run_cycle().unwrap();
        let rows = h.scheduler.snapshot();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, JobStatus::Running);
        assert!(rows[0].pid.is_some());
        assert_eq!(rows[1].gpu_label(), "none");
    }

    #[test]
    fn test_state_survives_reload() {
        let mut h = harness(&[(0, 12000)], 8000, "cmdA\ncmdB\n");
        h.scheduler.run_cycle().unwrap();
        let in_memory = h.scheduler.ledger().records().to_vec();
        assert_eq!(Ledger::load(&h.ledger_path()).unwrap(), in_memory);
    }

    #[tokio::test]
    async fn test_run_until_stops_on_shutdown() {
        let mut h = harness(&[(0, 12000)], 8000, "cmdA\n");
        h.scheduler
            .run_until(
                Duration::from_millis(5),
                tokio::time::sleep(Duration::from_millis(50)),
            )
            .await
            .unwrap();
        assert_eq!(h.status(1), JobStatus::Running);
        // In-flight jobs are not touched by shutdown
        assert_eq!(h.scheduler.running_count(), 1);
    }

    #[test]
    fn test_orphan_keeps_recorded_exit_code() {
        let dir = TempDir::new().unwrap();
        let log_a = log_path_for(dir.path(), 1);
        {
            let mut ledger = Ledger::open(dir.path().join("jobs.jsonl")).unwrap();
            ledger
                .append(JobRecord::new_pending(1, "cmdA", log_a.clone(), None))
                .unwrap();
            ledger
                .update(1, |job| job.mark_running(0, DEAD_PID, Some(HOST.to_string()), None))
                .unwrap();
        }
        let launcher = MockLauncher::default();
        launcher.exit_files.lock().unwrap().insert(log_a, 137);
        let mut h = build(dir, &[(0, 12000)], 8000, PlacementPolicy::Exclusive, launcher);

        assert_eq!(h.scheduler.recover().unwrap().orphaned, vec![1]);
        let job = h.scheduler.ledger().get(1).unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.exit_code, Some(137));
        assert_eq!(
            job.history().last().and_then(|c| c.note.as_deref()),
            Some("orphaned on recovery (recorded exit code 137)")
        );
        assert_eq!(Ledger::load(&h.ledger_path()).unwrap()[0].exit_code, Some(137));
    }

    #[test]
    fn test_unpollable_child_falls_back_to_liveness() {
        let mut h = harness(&[(0, 12000)], 8000, "cmdA\ncmdB\n");
        h.scheduler.run_cycle().unwrap();
        let pid = h.scheduler.ledger().get(1).unwrap().pid.unwrap();
        h.launcher.unpollable.lock().unwrap().insert(pid);
        h.launcher.alive.lock().unwrap().insert(pid);

        for _ in 0..MAX_POLL_ERRORS + 1 {
            h.scheduler.run_cycle().unwrap();
            assert_eq!(h.status(1), JobStatus::Running);
        }

        // Once polling is given up, liveness and the exit file decide
        h.launcher.alive.lock().unwrap().remove(&pid);
        let log_a = h.scheduler.ledger().get(1).unwrap().log_path.clone();
        h.launcher.exit_files.lock().unwrap().insert(log_a, 0);
        let report = h.scheduler.run_cycle().unwrap();
        assert_eq!(report.finished, vec![1]);
        assert_eq!(h.status(1), JobStatus::Completed);
        assert_eq!(report.placed.len(), 1);
        assert_eq!(report.placed[0].job_id, 2);
    }

    #[test]
    fn test_ledger_write_failure_is_fatal() {
        let mut h = harness(&[(0, 12000)], 8000, "cmdA\n");
        // A directory where the rewrite's temp file goes makes every update fail
        std::fs::create_dir(h.dir.path().join("jobs.jsonl.tmp")).unwrap();

        let err = h.scheduler.run_cycle().unwrap_err();
        assert!(matches!(err, DispatchError::LedgerWrite { .. }));
        assert!(err.is_fatal());
        assert_eq!(Ledger::load(&h.ledger_path()).unwrap()[0].status(), JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_run_until_stops_on_ledger_write_failure() {
        let mut h = harness(&[(0, 12000)], 8000, "cmdA\n");
        std::fs::create_dir(h.dir.path().join("jobs.jsonl.tmp")).unwrap();

        let result = h
            .scheduler
            .run_until(
                Duration::from_millis(5),
                tokio::time::sleep(Duration::from_secs(30)),
            )
            .await;
        assert!(matches!(result, Err(DispatchError::LedgerWrite { .. })));
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("shared".parse::<PlacementPolicy>().unwrap(), PlacementPolicy::Shared);
        assert_eq!(
            "Exclusive".parse::<PlacementPolicy>().unwrap(),
            PlacementPolicy::Exclusive
        );
        assert_eq!(PlacementPolicy::default().to_string(), "exclusive");
    }

    // Property-based tests for placement invariants
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn free_table() -> impl Strategy<Value = FreeMemory> {
            prop::collection::btree_map(0u32..8, 0u64..40_000, 0..8)
        }

        proptest! {
            /// Every placement saw at least the threshold on its GPU
            #[test]
            fn prop_threshold_respected(
                free in free_table(),
                jobs in 0usize..12,
                min in 0u64..20_000,
                shared in any::<bool>(),
            ) {
                let policy = if shared { PlacementPolicy::Shared } else { PlacementPolicy::Exclusive };
                let pending: Vec<JobId> = (1..=jobs as u32).collect();
                for p in plan_placements(&pending, &free, &BTreeSet::new(), min, policy) {
                    prop_assert!(p.free_mb >= min);
                    prop_assert!(free[&p.gpu] >= p.free_mb);
                }
            }

            /// Exclusive placements never share or reuse a busy GPU
            #[test]
            fn prop_exclusive_gpus_unique(
                free in free_table(),
                busy in prop::collection::btree_set(0u32..8, 0..4),
                jobs in 0usize..12,
                min in 0u64..20_000,
            ) {
                let pending: Vec<JobId> = (1..=jobs as u32).collect();
                let placements = plan_placements(&pending, &free, &busy, min, PlacementPolicy::Exclusive);
                let mut seen = BTreeSet::new();
                for p in &placements {
                    prop_assert!(!busy.contains(&p.gpu));
                    prop_assert!(seen.insert(p.gpu));
                }
                let eligible = free
                    .iter()
                    .filter(|(gpu, &mb)| !busy.contains(gpu) && mb >= min)
                    .count();
                prop_assert_eq!(placements.len(), eligible.min(jobs));
            }

            /// Placed jobs are always a prefix of the pending queue
            #[test]
            fn prop_fifo_prefix(
                free in free_table(),
                jobs in 0usize..12,
                min in 0u64..20_000,
                shared in any::<bool>(),
            ) {
                let policy = if shared { PlacementPolicy::Shared } else { PlacementPolicy::Exclusive };
                let pending: Vec<JobId> = (1..=jobs as u32).map(|i| i * 3).collect();
                let placements = plan_placements(&pending, &free, &BTreeSet::new(), min, policy);
                let placed: Vec<JobId> = placements.iter().map(|p| p.job_id).collect();
                prop_assert_eq!(&placed[..], &pending[..placed.len()]);
            }
        }
    }
}
