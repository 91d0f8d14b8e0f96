//! Child-process execution under a wall-clock deadline.
//!
//! One spawn-wait-collect cycle per call. The child is started in its own
//! process group; stdout and stderr are drained by two tasks running
//! concurrently with the exit wait, so a chatty child can never block on a
//! full pipe. When the deadline passes the whole group is killed, the drains
//! are joined, and the result is reported as timed out.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::env::ChildEnv;
use super::error::{ExecError, Result};
use super::resolve::ResolvedExecutable;

/// Exit code reported for children killed by the watchdog (same as `timeout(1)`).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How long to wait for the pipes to close once the group has been killed.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own with this code.
    Exited(i32),
    /// Killed by a signal we did not send.
    Signaled(i32),
    /// Killed by the watchdog.
    KilledByTimeout,
}

impl Termination {
    fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signaled(signal);
            }
        }
        Self::Exited(-1)
    }

    /// Shell-style integer view: signals map to 128 + n, the watchdog to 124.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Signaled(signal) => 128 + signal,
            Self::KilledByTimeout => TIMEOUT_EXIT_CODE,
        }
    }
}

/// Everything needed to spawn one child.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub executable: ResolvedExecutable,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: ChildEnv,
    pub timeout: Duration,
}

impl ExecutionPlan {
    /// argv as it will be executed, for logs and responses.
    pub fn command(&self) -> Vec<String> {
        std::iter::once(self.executable.path().display().to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Outcome of one child process. Never modified after the child is gone.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub command: Vec<String>,
    pub termination: Termination,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn exit_code(&self) -> i32 {
        self.termination.exit_code()
    }

    pub fn timed_out(&self) -> bool {
        self.termination == Termination::KilledByTimeout
    }

    pub fn success(&self) -> bool {
        self.termination == Termination::Exited(0)
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis().try_into().unwrap_or(u64::MAX)
    }
}

/// Runs `plan` to completion or until its timeout expires.
///
/// A non-zero exit is a normal `Ok` result; only a failure to create the
/// process at all is `ExecError::Spawn`. If the returned future is dropped
/// before completion the child's process group is killed.
pub async fn run(plan: &ExecutionPlan) -> Result<ExecutionResult> {
    let started = std::time::Instant::now();
    let deadline = Instant::now() + plan.timeout;
    let command = plan.command();

    let mut cmd = Command::new(plan.executable.path());
    cmd.args(&plan.args)
        .current_dir(&plan.working_dir)
        .env_clear()
        .envs(&plan.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Own process group, so the watchdog can take down grandchildren too
    #[cfg(unix)]
    {
        // SAFETY: setpgid is async-signal-safe and only changes the process group
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd.spawn().map_err(|source| {
        error!(
            "Spawn failed: executable={} args={:?} cwd={} error={source}",
            plan.executable.path().display(),
            plan.args,
            plan.working_dir.display(),
        );
        ExecError::Spawn {
            executable: plan.executable.path().to_path_buf(),
            source,
        }
    })?;

    let pid = child.id();
    let mut guard = GroupGuard::new(pid);
    debug!("Spawned pid={pid:?} command={command:?} timeout={:?}", plan.timeout);

    let mut stdout_task = tokio::spawn(drain(child.stdout.take()));
    let mut stderr_task = tokio::spawn(drain(child.stderr.take()));

    let mut termination = match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(Ok(status)) => Termination::from_status(status),
        Ok(Err(e)) => {
            kill_tree(&mut child, pid).await;
            stdout_task.abort();
            stderr_task.abort();
            return Err(ExecError::Io(e));
        }
        Err(_) => {
            warn!("Timeout after {:?}, killing process group of pid={pid:?}", plan.timeout);
            kill_tree(&mut child, pid).await;
            Termination::KilledByTimeout
        }
    };

    let drain_until = if termination == Termination::KilledByTimeout {
        Instant::now() + KILL_GRACE
    } else {
        deadline
    };
    let mut stdout = collect(&mut stdout_task, drain_until).await;
    let mut stderr = collect(&mut stderr_task, drain_until).await;

    if stdout.is_none() || stderr.is_none() {
        // The leader is gone but something in its group still holds a pipe
        if termination != Termination::KilledByTimeout {
            warn!("Descendants of pid={pid:?} outlived the deadline, killing process group");
            termination = Termination::KilledByTimeout;
        }
        if let Some(pgid) = pid {
            signal_group(pgid);
        }
        let grace = Instant::now() + KILL_GRACE;
        if stdout.is_none() {
            stdout = collect(&mut stdout_task, grace).await;
        }
        if stderr.is_none() {
            stderr = collect(&mut stderr_task, grace).await;
        }
        stdout_task.abort();
        stderr_task.abort();
    }
    guard.disarm();

    let mut stderr = stderr.unwrap_or_default();
    if termination == Termination::KilledByTimeout {
        stderr.extend_from_slice(timeout_note(plan.timeout).as_bytes());
    }

    let result = ExecutionResult {
        command,
        termination,
        stdout: stdout.unwrap_or_default(),
        stderr,
        duration: started.elapsed(),
    };

    info!(
        "Process finished pid={pid:?} exit_code={} timed_out={} duration_ms={} stdout_bytes={} stderr_bytes={}",
        result.exit_code(),
        result.timed_out(),
        result.duration_ms(),
        result.stdout.len(),
        result.stderr.len(),
    );

    Ok(result)
}

/// Appended to stderr of children killed by the watchdog.
fn timeout_note(timeout: Duration) -> String {
    format!("\nProcess timed out after {} seconds.", timeout.as_secs())
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!("Pipe read ended with error after {} bytes: {e}", buf.len());
        }
    }
    buf
}

/// `None` if the drain has not finished by `until`; the task is left running.
async fn collect(task: &mut JoinHandle<Vec<u8>>, until: Instant) -> Option<Vec<u8>> {
    match tokio::time::timeout_at(until, &mut *task).await {
        Ok(Ok(buf)) => Some(buf),
        Ok(Err(e)) => {
            warn!("Output drain task failed: {e}");
            Some(Vec::new())
        }
        Err(_) => None,
    }
}

/// Kills the process group, then the leader itself, and reaps it.
async fn kill_tree(child: &mut Child, pid: Option<u32>) {
    if let Some(pgid) = pid {
        signal_group(pgid);
    }
    if let Err(e) = child.kill().await {
        debug!("kill() on pid={pid:?}: {e}");
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; a stale group id yields ESRCH
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc == -1 {
        debug!(
            "killpg({pgid}) failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32) {}

/// Kills the child's process group when dropped while armed.
struct GroupGuard {
    pgid: Option<u32>,
}

impl GroupGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            debug!("Execution dropped mid-flight, killing process group {pgid}");
            signal_group(pgid);
        }
    }
}
