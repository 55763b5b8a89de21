//! Executor façade: the public entry point of the pool.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::{supervise, Broker, PoolState, PoolStats};
use crate::config::PoolConfig;
use crate::error::{PoolError, TaskError};
use crate::future::TaskFuture;
use crate::launch::build_launcher;
use crate::protocol::Call;
use crate::queue::{QueueItem, Task, TaskQueue};
use crate::traits::Launcher;

struct Shared {
    config: Arc<PoolConfig>,
    queue: Arc<TaskQueue>,
    pool: Arc<PoolState>,
    /// Becomes `true` once the broker has joined every slot.
    terminated: watch::Receiver<bool>,
    shut_down: AtomicBool,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("executor dropped without shutdown, stopping worker slots");
        let drained = self
            .queue
            .close_with_shutdown(self.pool.alive(), false, true);
        cancel_tasks(&self.pool, drained);
    }
}

/// Pool of worker slots that run submitted calls.
///
/// Cheap to clone; all clones drive the same pool. Dropping the last handle
/// without [`shutdown`](Self::shutdown) stops the slots without waiting.
///
/// # Example
/// ```ignore
/// let exe = Executor::new(PoolConfig::new(2).backend(BackendKind::Local))?;
/// let fut = exe.submit(Call::new("add").arg(2).arg(3))?;
/// assert_eq!(fut.await?, json!(5));
/// exe.shutdown(true, false).await?;
/// ```
#[derive(Clone)]
pub struct Executor {
    shared: Arc<Shared>,
}

impl Executor {
    /// Start a pool using the launcher selected by `config.backend`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        let launcher = build_launcher(&config)?;
        Self::with_launcher(config, launcher)
    }

    /// Start a pool with a caller-provided launcher.
    pub fn with_launcher(config: PoolConfig, launcher: Arc<dyn Launcher>) -> Result<Self, PoolError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            PoolError::Configuration("the executor must be created inside a tokio runtime".into())
        })?;

        let config = Arc::new(config);
        let queue = Arc::new(TaskQueue::new());
        let pool = Arc::new(PoolState::new(config.max_workers));
        let broker = Broker::new(
            Arc::clone(&config),
            launcher,
            Arc::clone(&queue),
            Arc::clone(&pool),
        );
        let (done, terminated) = watch::channel(false);
        runtime.spawn(supervise(broker, done));
        info!(
            max_workers = config.max_workers,
            backend = %config.backend,
            cores_per_worker = config.cores_per_worker,
            "executor started"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                queue,
                pool,
                terminated,
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Run `body` with a fresh executor and always shut it down afterwards,
    /// waiting for running tasks. A panic in `body` is resumed after the
    /// shutdown.
    pub async fn scoped<F, Fut, T>(config: PoolConfig, body: F) -> Result<T, PoolError>
    where
        F: FnOnce(Executor) -> Fut,
        Fut: Future<Output = Result<T, PoolError>>,
    {
        let executor = Self::new(config)?;
        let outcome = AssertUnwindSafe(body(executor.clone())).catch_unwind().await;
        let shutdown = executor.shutdown(true, false).await;
        match outcome {
            Ok(result) => {
                let value = result?;
                shutdown?;
                Ok(value)
            }
            Err(panic) => {
                if let Err(e) = shutdown {
                    warn!(error = %e, "shutdown after panic failed");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Queue a call and return its future immediately.
    ///
    /// Fails with a pending slot failure first, if one was recorded since
    /// the last check.
    pub fn submit(&self, call: Call) -> Result<TaskFuture, PoolError> {
        self.check()?;
        if self.shared.shut_down.load(Ordering::SeqCst) {
            return Err(PoolError::ExecutorShutdown);
        }
        let future = TaskFuture::new();
        let task = Task {
            call,
            future: future.clone(),
        };
        match self.shared.queue.push(QueueItem::Task(task)) {
            Ok(()) => {
                self.shared.pool.task_submitted();
                Ok(future)
            }
            Err(_) if self.shared.shut_down.load(Ordering::SeqCst) => {
                Err(PoolError::ExecutorShutdown)
            }
            Err(_) => Err(PoolError::NoLiveWorkers),
        }
    }

    /// Submit `function` once per argument list and yield the results in
    /// submission order.
    pub fn map<I>(
        &self,
        function: &str,
        inputs: I,
    ) -> Result<BoxStream<'static, Result<Value, TaskError>>, PoolError>
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        let futures = inputs
            .into_iter()
            .map(|args| self.submit(Call::new(function).args(args)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stream::iter(futures)
            .then(|future| async move { future.result().await })
            .boxed())
    }

    /// Stop the pool.
    ///
    /// Sends one stop request per live slot. With `cancel_futures`, tasks
    /// that have not started are cancelled instead of executed. With `wait`,
    /// returns once every slot has exited, for every caller and every clone.
    pub async fn shutdown(&self, wait: bool, cancel_futures: bool) -> Result<(), PoolError> {
        if !self.shared.shut_down.swap(true, Ordering::SeqCst) {
            let slots = self.shared.pool.alive();
            info!(slots, wait, cancel_futures, "shutting down executor");
            let drained = self
                .shared
                .queue
                .close_with_shutdown(slots, wait, cancel_futures);
            cancel_tasks(&self.shared.pool, drained);
        }

        if wait {
            let mut terminated = self.shared.terminated.clone();
            // a closed channel means the supervisor task is gone as well
            let _ = terminated.wait_for(|done| *done).await;
        }
        self.check()
    }

    /// Re-raise the oldest fatal slot failure not reported yet.
    pub fn check(&self) -> Result<(), PoolError> {
        match self.shared.pool.take_failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Wait until every slot has finished launching, then report the first
    /// launch failure, if any.
    pub async fn wait_ready(&self) -> Result<(), PoolError> {
        self.shared.pool.all_settled().await;
        self.check()
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.pool.snapshot(self.shared.queue.len())
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shut_down.load(Ordering::SeqCst)
    }
}

fn cancel_tasks(pool: &PoolState, tasks: Vec<Task>) {
    if tasks.is_empty() {
        return;
    }
    debug!(tasks = tasks.len(), "cancelling queued tasks");
    for task in tasks {
        if task.future.cancel() {
            pool.task_cancelled();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::{LaunchHandle, WorkerCommand};
    use async_trait::async_trait;

    /// Launcher that never produces a process group.
    struct BrokenLauncher;

    #[async_trait]
    impl Launcher for BrokenLauncher {
        fn name(&self) -> &str {
            "broken"
        }

        fn ranks(&self) -> usize {
            1
        }

        async fn bootup(&self, _command: &WorkerCommand) -> Result<LaunchHandle, PoolError> {
            Err(PoolError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such launcher",
            )))
        }
    }

    /// Launcher whose bootup panics.
    struct PanickingLauncher;

    #[async_trait]
    impl Launcher for PanickingLauncher {
        fn name(&self) -> &str {
            "panicking"
        }

        fn ranks(&self) -> usize {
            1
        }

        async fn bootup(&self, _command: &WorkerCommand) -> Result<LaunchHandle, PoolError> {
            panic!("launcher blew up")
        }
    }

    fn broken(max_workers: usize) -> Executor {
        let config = PoolConfig::new(max_workers).worker_program("/nonexistent");
        Executor::with_launcher(config, Arc::new(BrokenLauncher)).unwrap()
    }

    #[test]
    fn requires_a_runtime() {
        let err = Executor::with_launcher(PoolConfig::new(1), Arc::new(BrokenLauncher))
            .err()
            .unwrap();
        assert!(matches!(err, PoolError::Configuration(_)));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_up_front() {
        let err = Executor::new(PoolConfig::new(1).threads_per_core(2)).err().unwrap();
        assert!(matches!(err, PoolError::Configuration(_)));
    }

    #[tokio::test]
    async fn bootup_failures_surface_once_each() {
        let exe = broken(2);
        exe.wait_ready().await.unwrap_err();

        let second = exe.check().unwrap_err();
        assert!(matches!(second, PoolError::Bootup { .. }));
        exe.check().unwrap();

        // every slot is dead now
        let err = exe.submit(Call::new("add")).unwrap_err();
        assert!(matches!(err, PoolError::NoLiveWorkers));
        exe.shutdown(true, false).await.unwrap();
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_refused() {
        let exe = broken(1);
        exe.wait_ready().await.unwrap_err();
        exe.shutdown(true, false).await.unwrap();

        assert!(exe.is_shutdown());
        assert!(matches!(
            exe.submit(Call::new("add")),
            Err(PoolError::ExecutorShutdown)
        ));
    }

    #[tokio::test]
    async fn panicking_slot_is_reraised_by_wait_ready() {
        let config = PoolConfig::new(2).worker_program("/nonexistent");
        let exe = Executor::with_launcher(config, Arc::new(PanickingLauncher)).unwrap();

        let err = tokio::time::timeout(std::time::Duration::from_secs(3), exe.wait_ready())
            .await
            .expect("wait_ready hung after a slot panicked")
            .unwrap_err();
        assert!(
            matches!(err, PoolError::Supervisor(ref m) if m.contains("launcher blew up")),
            "got {err}"
        );
        assert!(matches!(exe.check(), Err(PoolError::Supervisor(_))));
        exe.check().unwrap();

        let stats = exe.stats();
        assert_eq!(stats.alive_slots, 0);
        assert_eq!(stats.ready_slots, 0);
        assert!(matches!(
            exe.submit(Call::new("add")),
            Err(PoolError::NoLiveWorkers)
        ));
        tokio::time::timeout(std::time::Duration::from_secs(3), exe.shutdown(true, false))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn every_waiting_shutdown_sees_termination() {
        let exe = broken(1);
        exe.wait_ready().await.unwrap_err();
        let other = exe.clone();

        let (first, second) = tokio::join!(exe.shutdown(true, false), other.shutdown(true, false));
        first.unwrap();
        second.unwrap();
        assert!(*exe.shared.terminated.borrow());
    }
}
