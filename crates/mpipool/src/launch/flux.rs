use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{JobHandle, JobId, JobSpec, JobState, LaunchHandle, WorkerCommand};
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::traits::{JobScheduler, Launcher};

/// Submits every worker slot as a job through a [`JobScheduler`].
pub struct FluxLauncher {
    scheduler: Arc<dyn JobScheduler>,
    cores: usize,
    threads_per_core: usize,
    gpus_per_core: usize,
    cwd: Option<PathBuf>,
    poll_interval: Duration,
}

impl FluxLauncher {
    pub fn from_config(config: &PoolConfig, scheduler: Arc<dyn JobScheduler>) -> Self {
        Self {
            scheduler,
            cores: config.cores_per_worker,
            threads_per_core: config.threads_per_core,
            gpus_per_core: config.gpus_per_core(),
            cwd: config.working_directory.clone(),
            poll_interval: config.poll_interval(),
        }
    }

    /// Job description for one slot.
    pub fn job_spec(&self, command: &WorkerCommand) -> JobSpec {
        JobSpec {
            command: command.argv(),
            num_tasks: self.cores,
            cores_per_task: self.threads_per_core,
            gpus_per_task: self.gpus_per_core,
            cwd: self.cwd.clone(),
            environment: vec![(
                "OMP_NUM_THREADS".to_string(),
                self.threads_per_core.to_string(),
            )],
        }
    }
}

#[async_trait]
impl Launcher for FluxLauncher {
    fn name(&self) -> &str {
        "flux"
    }

    fn ranks(&self) -> usize {
        self.cores
    }

    async fn bootup(&self, command: &WorkerCommand) -> Result<LaunchHandle, PoolError> {
        let spec = self.job_spec(command);
        let id = self.scheduler.submit(&spec).await?;
        info!(job = %id, tasks = spec.num_tasks, "submitted flux job");
        Ok(LaunchHandle::Job(JobHandle::new(
            id,
            Arc::clone(&self.scheduler),
            self.poll_interval,
        )))
    }
}

/// [`JobScheduler`] backed by the `flux` command-line tool.
#[derive(Debug, Clone)]
pub struct FluxCli {
    program: PathBuf,
}

impl FluxCli {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("flux"),
        }
    }

    /// Use a specific `flux` executable.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Arguments of the `flux submit` call for a job.
    pub fn submit_args(spec: &JobSpec) -> Vec<String> {
        let mut args = vec![
            "submit".to_string(),
            format!("--ntasks={}", spec.num_tasks),
            format!("--cores-per-task={}", spec.cores_per_task),
        ];
        if spec.gpus_per_task > 0 {
            args.push(format!("--gpus-per-task={}", spec.gpus_per_task));
        }
        for (key, value) in &spec.environment {
            args.push(format!("--env={key}={value}"));
        }
        args.push("--".into());
        args.extend(spec.command.iter().cloned());
        args
    }

    async fn run(&self, args: &[String], cwd: Option<&PathBuf>) -> Result<String, PoolError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(PoolError::Communication(format!(
                "flux {} failed ({}): {}",
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for FluxCli {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a `flux jobs --format={state},{result}` line to a [`JobState`].
pub(crate) fn parse_flux_state(line: &str) -> JobState {
    let (state, result) = line.trim().split_once(',').unwrap_or((line.trim(), ""));
    match state.to_ascii_uppercase().as_str() {
        "DEPEND" | "PRIORITY" | "SCHED" | "NEW" => JobState::Pending,
        "RUN" | "CLEANUP" => JobState::Running,
        "INACTIVE" => match result.trim().to_ascii_uppercase().as_str() {
            "COMPLETED" => JobState::Completed,
            "CANCELED" | "CANCELLED" => JobState::Cancelled,
            other => JobState::Failed(other.to_ascii_lowercase()),
        },
        other => JobState::Failed(format!("unknown state {other}")),
    }
}

#[async_trait]
impl JobScheduler for FluxCli {
    async fn submit(&self, spec: &JobSpec) -> Result<JobId, PoolError> {
        let id = self.run(&Self::submit_args(spec), spec.cwd.as_ref()).await?;
        if id.is_empty() {
            return Err(PoolError::Communication("flux submit printed no job id".into()));
        }
        Ok(JobId(id))
    }

    async fn state(&self, job: &JobId) -> Result<JobState, PoolError> {
        let args = [
            "jobs".to_string(),
            "--no-header".to_string(),
            "--format={state},{result}".to_string(),
            job.0.clone(),
        ];
        let line = self.run(&args, None).await?;
        let state = parse_flux_state(&line);
        debug!(job = %job, state = %state, "polled flux job");
        Ok(state)
    }

    async fn cancel(&self, job: &JobId) -> Result<(), PoolError> {
        match self.run(&["cancel".to_string(), job.0.clone()], None).await {
            Ok(_) => Ok(()),
            Err(e) => match self.state(job).await {
                Ok(state) if state.is_terminal() => Ok(()),
                _ => Err(e),
            },
        }
    }
}
