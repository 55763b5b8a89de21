use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_MAX_FRAME_BYTES;

// ── Top-level config ────────────────────────────────────────────────

/// Resource specification for one worker pool.
///
/// Consumed once when the executor is built; the pool never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worker slots (process groups) run concurrently.
    #[serde(default = "default_one")]
    pub max_workers: usize,

    /// Ranks started per worker slot.
    #[serde(default = "default_one")]
    pub cores_per_worker: usize,

    /// Threads per rank (exported as `OMP_NUM_THREADS` / `--cpus-per-task`).
    #[serde(default = "default_one")]
    pub threads_per_core: usize,

    /// GPUs per worker slot, split evenly across its ranks.
    #[serde(default)]
    pub gpus_per_worker: usize,

    /// Pass the launcher's oversubscription flag.
    #[serde(default)]
    pub oversubscribe: bool,

    /// Working directory of the launched processes.
    #[serde(default)]
    pub working_directory: Option<PathBuf>,

    /// Poll interval for backends that watch a job handle (milliseconds).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Which launch backend starts the worker process groups.
    #[serde(default)]
    pub backend: BackendKind,

    /// Entry-point executable; defaults to `mpipool-worker` next to the
    /// current executable.
    #[serde(default)]
    pub worker_program: Option<PathBuf>,

    /// Extra arguments placed before `--host`/`--port`.
    #[serde(default)]
    pub worker_args: Vec<String>,

    /// Registered zero-argument function run once per slot at startup.
    #[serde(default)]
    pub initializer: Option<String>,

    /// Interface the controller binds its per-slot listener on.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Grace period between a clean-exit request and a forced kill (milliseconds).
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Largest accepted wire frame.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

/// Launch backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Direct `mpiexec` launch.
    #[default]
    Mpiexec,
    /// SLURM job step via `srun`.
    Srun,
    /// Flux job submission API.
    Flux,
    /// Plain child processes, one per rank (no MPI launcher).
    Local,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mpiexec => "mpiexec",
            Self::Srun => "srun",
            Self::Flux => "flux",
            Self::Local => "local",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mpiexec" | "mpi" => Ok(Self::Mpiexec),
            "srun" | "slurm" => Ok(Self::Srun),
            "flux" => Ok(Self::Flux),
            "local" => Ok(Self::Local),
            other => Err(format!(
                "unknown backend '{other}', expected one of mpiexec, srun, flux, local"
            )),
        }
    }
}

fn default_one() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_bind_host() -> String {
    "127.0.0.1".into()
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

impl PoolConfig {
    /// Config with `max_workers` slots and defaults everywhere else.
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            cores_per_worker: default_one(),
            threads_per_core: default_one(),
            gpus_per_worker: 0,
            oversubscribe: false,
            working_directory: None,
            poll_interval_ms: default_poll_interval_ms(),
            backend: BackendKind::default(),
            worker_program: None,
            worker_args: Vec::new(),
            initializer: None,
            bind_host: default_bind_host(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }

    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn cores_per_worker(mut self, cores: usize) -> Self {
        self.cores_per_worker = cores;
        self
    }

    pub fn threads_per_core(mut self, threads: usize) -> Self {
        self.threads_per_core = threads;
        self
    }

    pub fn gpus_per_worker(mut self, gpus: usize) -> Self {
        self.gpus_per_worker = gpus;
        self
    }

    pub fn oversubscribe(mut self, oversubscribe: bool) -> Self {
        self.oversubscribe = oversubscribe;
        self
    }

    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn initializer(mut self, function: impl Into<String>) -> Self {
        self.initializer = Some(function.into());
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// GPUs bound to each rank of a worker slot.
    pub fn gpus_per_core(&self) -> usize {
        self.gpus_per_worker / self.cores_per_worker.max(1)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(1)
    }
}
