use super::{GpuId, JobId};
use anyhow::{Context, Result};
use std::fs::File;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

/// Everything needed to start one job
#[derive(Debug, Clone)]
pub struct LaunchRequest<'a> {
    pub job_id: JobId,
    pub command: &'a str,
    pub gpu: GpuId,
    pub log_path: &'a Path,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exit code, or `None` when the process was killed by a signal
    Exited(Option<i32>),
}

/// A launched process owned by the scheduler
pub trait ProcessHandle: Send {
    fn pid(&self) -> u32;

    /// Non-blocking exit check
    fn poll(&mut self) -> std::io::Result<ProcessState>;
}

/// Starts job processes pinned to one GPU.
pub trait Launcher {
    fn launch(&self, request: &LaunchRequest<'_>) -> Result<Box<dyn ProcessHandle>>;

    /// Whether `pid` is a live process on this host
    fn is_alive(&self, pid: u32) -> bool {
        is_alive(pid)
    }

    /// Exit code left behind by a job whose process we do not own
    fn recorded_exit_code(&self, _log_path: &Path) -> Option<i32> {
        None
    }
}

/// Runs commands through `sh -c` with `CUDA_VISIBLE_DEVICES` set and output
/// redirected to the job's log file.
///
/// Every command is wrapped so its exit code also lands in `<log>.exit`; that
/// file is how a restarted dispatcher learns the outcome of a job it adopted.
pub struct ShellLauncher {
    shell: PathBuf,
}

// $1 = user command, $2 = exit status file
const WRAPPER_SCRIPT: &str = r#"sh -c "$1"; status=$?; printf '%s\n' "$status" > "$2"; exit "$status""#;

impl Default for ShellLauncher {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("sh"),
        }
    }
}

impl ShellLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn build_command(&self, request: &LaunchRequest<'_>) -> Result<Command> {
        if let Some(parent) = request.log_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
        }

        let exit_path = exit_status_path(request.log_path);
        match std::fs::remove_file(&exit_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to remove stale exit file {}", exit_path.display())
                })
            }
        }

        let stdout = File::create(request.log_path)
            .with_context(|| format!("Failed to create log file {}", request.log_path.display()))?;
        let stderr = stdout.try_clone()?;

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(WRAPPER_SCRIPT)
            .arg("cudaq-job")
            .arg(request.command)
            .arg(&exit_path)
            .env("CUDA_VISIBLE_DEVICES", request.gpu.to_string())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            // Own process group: terminal signals sent to the dispatcher must not reach jobs
            .process_group(0);
        Ok(cmd)
    }
}

impl Launcher for ShellLauncher {
    fn launch(&self, request: &LaunchRequest<'_>) -> Result<Box<dyn ProcessHandle>> {
        let mut cmd = self.build_command(request)?;
        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.shell.display()))?;
        tracing::debug!(
            "Spawned job {} (pid {}) on GPU {}",
            request.job_id,
            child.id(),
            request.gpu
        );
        Ok(Box::new(ChildHandle(child)))
    }

    fn recorded_exit_code(&self, log_path: &Path) -> Option<i32> {
        std::fs::read_to_string(exit_status_path(log_path))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }
}

struct ChildHandle(Child);

impl ProcessHandle for ChildHandle {
    fn pid(&self) -> u32 {
        self.0.id()
    }

    fn poll(&mut self) -> std::io::Result<ProcessState> {
        Ok(match self.0.try_wait()? {
            Some(status) => ProcessState::Exited(status.code()),
            None => ProcessState::Running,
        })
    }
}

/// `<log>.exit`
pub fn exit_status_path(log_path: &Path) -> PathBuf {
    let mut name = log_path.as_os_str().to_owned();
    name.push(".exit");
    PathBuf::from(name)
}

/// Check whether a process exists, including ones owned by other users.
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

pub fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer length passed matches the buffer.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec()).ok()
}
