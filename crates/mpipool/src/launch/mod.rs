//! Launch backends: how a worker slot's process group gets started.
//!
//! - [`MpiExecLauncher`] spawns `mpiexec` directly
//! - [`SrunLauncher`] runs the group as a SLURM job step
//! - [`FluxLauncher`] submits a job through a [`JobScheduler`](crate::JobScheduler)
//! - [`LocalLauncher`] spawns one plain child process per rank
//!
//! All of them return a [`LaunchHandle`], which the transport watches during
//! the connect handshake and terminates at shutdown.

mod flux;
mod local;
mod mpiexec;
mod srun;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::config::{BackendKind, PoolConfig};
use crate::error::PoolError;
use crate::traits::{JobScheduler, Launcher};

pub use flux::{FluxCli, FluxLauncher};
pub use local::LocalLauncher;
pub use mpiexec::MpiExecLauncher;
pub use srun::SrunLauncher;

/// Build the launcher selected by `config.backend`.
pub fn build_launcher(config: &PoolConfig) -> Result<Arc<dyn Launcher>, PoolError> {
    config.validate()?;
    let launcher: Arc<dyn Launcher> = match config.backend {
        BackendKind::Mpiexec => Arc::new(MpiExecLauncher::from_config(config)),
        BackendKind::Srun => Arc::new(SrunLauncher::from_config(config)),
        BackendKind::Flux => Arc::new(FluxLauncher::from_config(config, Arc::new(FluxCli::new()))),
        BackendKind::Local => Arc::new(LocalLauncher::from_config(config)),
    };
    Ok(launcher)
}

// ── Entry-point command ──────────────────────────────────────────────

/// The backend entry point a launcher wraps with its own prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append the controller endpoint the ranks must connect to.
    pub fn with_endpoint(&self, endpoint: SocketAddr) -> Self {
        self.clone().args([
            "--host".to_string(),
            endpoint.ip().to_string(),
            "--port".to_string(),
            endpoint.port().to_string(),
        ])
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Build a tokio command from an argv, killed when its handle is dropped.
pub(crate) fn command_from_argv(argv: &[String], cwd: Option<&Path>) -> Result<Command, PoolError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| PoolError::Configuration("empty launch command".into()))?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    Ok(cmd)
}

// ── Handles ──────────────────────────────────────────────────────────

/// Time a launcher process gets between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// A running worker process group, as returned by [`Launcher::bootup`].
pub enum LaunchHandle {
    /// Child processes owned by this controller.
    Processes(ProcessGroup),
    /// A job owned by a cluster scheduler.
    Job(JobHandle),
}

impl LaunchHandle {
    /// Resolve once the group has stopped running, with a short description
    /// of how it ended.
    ///
    /// For child processes this fires as soon as any one of them exits.
    pub async fn exited(&mut self) -> String {
        match self {
            Self::Processes(group) => match group.wait_any().await {
                Ok(status) => status.to_string(),
                Err(e) => format!("wait failed: {e}"),
            },
            Self::Job(job) => match job.wait_finished().await {
                Ok(state) => format!("job {} {state}", job.id),
                Err(e) => format!("job {} could not be polled: {e}", job.id),
            },
        }
    }

    /// Stop the group. With `wait`, allow `grace` for a clean exit first and
    /// report [`PoolError::ShutdownTimeout`] if it had to be forced.
    pub async fn terminate(&mut self, wait: bool, grace: Duration) -> Result<(), PoolError> {
        match self {
            Self::Processes(group) => {
                if wait {
                    match tokio::time::timeout(grace, group.wait_all()).await {
                        Ok(statuses) => {
                            for status in statuses? {
                                if !status.success() {
                                    warn!(status = %status, "worker process exited uncleanly");
                                }
                            }
                            return Ok(());
                        }
                        Err(_) => {
                            group.stop_all(TERM_GRACE).await;
                            return Err(PoolError::ShutdownTimeout(grace));
                        }
                    }
                }
                group.stop_all(TERM_GRACE).await;
                Ok(())
            }
            Self::Job(job) => {
                if wait {
                    if let Ok(result) = tokio::time::timeout(grace, job.wait_finished()).await {
                        let state = result?;
                        debug!(job = %job.id, state = %state, "job finished");
                        return Ok(());
                    }
                    job.cancel().await?;
                    return Err(PoolError::ShutdownTimeout(grace));
                }
                job.cancel().await
            }
        }
    }
}

/// Child processes started for one worker slot.
pub struct ProcessGroup {
    children: Vec<Child>,
}

impl ProcessGroup {
    /// Spawn every command; if one fails, the ones already started are
    /// killed when the partial group is dropped.
    pub fn spawn(commands: Vec<Command>) -> Result<Self, PoolError> {
        let mut children = Vec::with_capacity(commands.len());
        for mut cmd in commands {
            children.push(cmd.spawn()?);
        }
        Ok(Self { children })
    }

    pub fn pids(&self) -> Vec<u32> {
        self.children.iter().filter_map(Child::id).collect()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    async fn wait_any(&mut self) -> std::io::Result<ExitStatus> {
        if self.children.is_empty() {
            return std::future::pending().await;
        }
        let waits = self.children.iter_mut().map(|c| Box::pin(c.wait()));
        let (status, _, _) = select_all(waits).await;
        status
    }

    async fn wait_all(&mut self) -> std::io::Result<Vec<ExitStatus>> {
        let mut statuses = Vec::with_capacity(self.children.len());
        for child in &mut self.children {
            statuses.push(child.wait().await?);
        }
        Ok(statuses)
    }

    /// SIGTERM every process so `mpiexec` and `srun` can take their ranks
    /// down, then SIGKILL whatever is still running after `term_grace`.
    async fn stop_all(&mut self, term_grace: Duration) {
        let mut signalled = false;
        for child in &self.children {
            if let Some(pid) = child.id() {
                signalled |= send_sigterm(pid);
            }
        }
        if signalled
            && matches!(
                tokio::time::timeout(term_grace, self.wait_all()).await,
                Ok(Ok(_))
            )
        {
            return;
        }
        for child in &mut self.children {
            let _ = child.start_kill();
        }
        for child in &mut self.children {
            let _ = child.wait().await;
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            debug!(pid, error = %e, "SIGTERM failed");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> bool {
    false
}

/// A job submitted through a [`JobScheduler`].
pub struct JobHandle {
    pub id: JobId,
    scheduler: Arc<dyn JobScheduler>,
    poll_interval: Duration,
}

impl JobHandle {
    pub fn new(id: JobId, scheduler: Arc<dyn JobScheduler>, poll_interval: Duration) -> Self {
        Self {
            id,
            scheduler,
            poll_interval,
        }
    }

    /// Poll the scheduler until the job reaches a terminal state.
    pub async fn wait_finished(&self) -> Result<JobState, PoolError> {
        loop {
            let state = self.scheduler.state(&self.id).await?;
            if state.is_terminal() {
                return Ok(state);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub async fn cancel(&self) -> Result<(), PoolError> {
        self.scheduler.cancel(&self.id).await
    }
}

// ── Scheduler job model ──────────────────────────────────────────────

/// Scheduler-assigned job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job description handed to a [`JobScheduler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Entry-point argv run by every task of the job.
    pub command: Vec<String>,
    /// Number of tasks (ranks).
    pub num_tasks: usize,
    /// Cores reserved for each task.
    pub cores_per_task: usize,
    /// GPUs reserved for each task.
    pub gpus_per_task: usize,
    pub cwd: Option<PathBuf>,
    /// Environment exported to the job.
    pub environment: Vec<(String, String)>,
}

/// Lifecycle of a scheduler job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed(String),
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Cancelled)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Running => f.write_str("running"),
            Self::Completed => f.write_str("completed"),
            Self::Failed(reason) => write!(f, "failed ({reason})"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}
