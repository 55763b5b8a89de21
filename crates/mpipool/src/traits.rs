use std::time::Duration;

use async_trait::async_trait;

use crate::error::PoolError;
use crate::launch::{JobId, JobSpec, JobState, LaunchHandle, WorkerCommand};

/// Turns a resource specification into a running worker process group.
///
/// Every backend (direct `mpiexec`, `srun` job step, Flux job API, plain
/// local processes) implements the same two operations, so a worker slot
/// never needs to know which one it holds.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Number of ranks one [`bootup`](Self::bootup) starts. Each rank
    /// connects back to the controller separately.
    fn ranks(&self) -> usize;

    /// Start the entry-point command and return a handle to the running group.
    async fn bootup(&self, command: &WorkerCommand) -> Result<LaunchHandle, PoolError>;

    /// Terminate a running group. With `wait`, give it `grace` to exit on its
    /// own before forcing it down.
    async fn shutdown(
        &self,
        handle: &mut LaunchHandle,
        wait: bool,
        grace: Duration,
    ) -> Result<(), PoolError> {
        handle.terminate(wait, grace).await
    }
}

/// Job submission API of a cluster scheduler.
///
/// Used by the scheduler-API launch backend: jobs are described by a
/// [`JobSpec`] and tracked through an opaque [`JobId`] instead of a child
/// process.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Submit a job and return its id once accepted.
    async fn submit(&self, spec: &JobSpec) -> Result<JobId, PoolError>;

    /// Current state of a submitted job.
    async fn state(&self, job: &JobId) -> Result<JobState, PoolError>;

    /// Request cancellation. Cancelling a finished job is not an error.
    async fn cancel(&self, job: &JobId) -> Result<(), PoolError>;
}
