//! Worker slot: one process group, one transport, one serve loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Map, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::broker::{fail_orphaned_tasks, PoolState};
use crate::codec::WireCodec;
use crate::config::PoolConfig;
use crate::error::{PoolError, TaskError};
use crate::future::TaskFuture;
use crate::launch::WorkerCommand;
use crate::protocol::Call;
use crate::queue::{QueueItem, Task, TaskQueue};
use crate::traits::Launcher;
use crate::transport::Transport;

/// Lifecycle of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Launching,
    Ready,
    Executing,
    Draining,
    Terminated,
    Failed,
}

/// What one slot has contributed to the pool counters, and the task it is
/// running. Lives outside the slot task so the broker can settle the
/// accounts of a slot that died without finishing.
#[derive(Debug, Default)]
pub(crate) struct SlotProgress {
    settled: AtomicBool,
    ready: AtomicBool,
    exited: AtomicBool,
    in_flight: Mutex<Option<TaskFuture>>,
}

impl SlotProgress {
    fn in_flight(&self) -> std::sync::MutexGuard<'_, Option<TaskFuture>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, pool: &PoolState) {
        if !self.settled.swap(true, Ordering::SeqCst) {
            pool.slot_settled();
        }
    }

    fn mark_ready(&self, pool: &PoolState) {
        if !self.ready.swap(true, Ordering::SeqCst) {
            pool.slot_ready();
        }
    }

    fn mark_gone(&self, pool: &PoolState) {
        if self.ready.swap(false, Ordering::SeqCst) {
            pool.slot_gone();
        }
    }

    /// Count the slot out of the pool; fails leftover tasks if it was the last.
    fn exit(&self, pool: &PoolState, queue: &TaskQueue) {
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        let remaining = pool.slot_exited();
        debug!(remaining, "worker slot exited");
        if remaining == 0 {
            fail_orphaned_tasks(queue, pool);
        }
    }

    /// Close the books of a slot task that stopped abnormally: fail its
    /// running task, record `err` and release every counter it still holds.
    pub(crate) fn abandon(&self, pool: &PoolState, queue: &TaskQueue, err: PoolError) {
        if let Some(future) = self.in_flight().take() {
            if future.set_error(TaskError::Communication(err.to_string())) {
                pool.task_finished(false);
            }
        }
        self.mark_gone(pool);
        pool.record_failure(err);
        self.exit(pool, queue);
        self.settle(pool);
    }
}

pub(crate) struct WorkerSlot {
    id: usize,
    config: Arc<PoolConfig>,
    launcher: Arc<dyn Launcher>,
    queue: Arc<TaskQueue>,
    pool: Arc<PoolState>,
    progress: Arc<SlotProgress>,
    state: SlotState,
    init_state: Map<String, Value>,
}

impl WorkerSlot {
    pub(crate) fn new(
        id: usize,
        config: Arc<PoolConfig>,
        launcher: Arc<dyn Launcher>,
        queue: Arc<TaskQueue>,
        pool: Arc<PoolState>,
        progress: Arc<SlotProgress>,
    ) -> Self {
        Self {
            id,
            config,
            launcher,
            queue,
            pool,
            progress,
            state: SlotState::Launching,
            init_state: Map::new(),
        }
    }

    /// Launch the process group and serve tasks until told to stop.
    ///
    /// A failed launch or a broken link is recorded as a fatal slot failure
    /// for the executor to re-raise.
    #[instrument(skip_all, fields(slot = self.id))]
    pub(crate) async fn run(mut self) {
        match self.launch().await {
            Ok(transport) => {
                self.progress.mark_ready(&self.pool);
                self.progress.settle(&self.pool);
                self.transition(SlotState::Ready);
                let result = self.serve(transport).await;
                self.progress.mark_gone(&self.pool);
                self.finish(result);
            }
            Err(e) => {
                self.transition(SlotState::Failed);
                self.finish(Err(e));
                // settle last so a launch failure is visible once launching is over
                self.progress.settle(&self.pool);
            }
        }
    }

    fn finish(&self, result: Result<(), PoolError>) {
        if let Err(e) = result {
            error!(error = %e, "worker slot failed");
            self.pool.record_failure(e);
        }
        self.progress.exit(&self.pool, &self.queue);
    }

    async fn launch(&mut self) -> Result<Transport, PoolError> {
        let codec = WireCodec::new(self.config.max_frame_bytes);
        let mut transport = Transport::bind(self.id, &self.config.bind_host, codec)
            .await
            .map_err(|e| self.bootup_error(e))?
            .with_shutdown_grace(self.config.shutdown_grace());

        let program = self
            .config
            .resolved_worker_program()
            .map_err(|e| self.bootup_error(e))?;
        let command = WorkerCommand::new(program).args(self.config.worker_args.iter().cloned());
        transport
            .bootup(Arc::clone(&self.launcher), &command)
            .await?;

        if let Some(initializer) = self.config.initializer.clone() {
            match self.initialize(&mut transport, &initializer).await {
                Ok(state) => {
                    debug!(keys = state.len(), "initializer state stored");
                    self.init_state = state;
                }
                Err(e) => {
                    transport.abort().await;
                    return Err(self.bootup_error(e));
                }
            }
        }
        info!(ranks = transport.ranks(), "worker slot ready");
        Ok(transport)
    }

    /// Run the initializer; the mapping from rank 0 becomes default kwargs.
    async fn initialize(
        &self,
        transport: &mut Transport,
        initializer: &str,
    ) -> Result<Map<String, Value>, PoolError> {
        let value = transport
            .send_and_receive(Uuid::new_v4(), Call::new(initializer))
            .await?
            .map_err(PoolError::RemoteExecution)?;
        let value = if self.launcher.ranks() > 1 {
            match value {
                Value::Array(mut per_rank) if !per_rank.is_empty() => per_rank.swap_remove(0),
                other => other,
            }
        } else {
            value
        };
        match value {
            Value::Object(map) => Ok(map),
            other => Err(PoolError::Configuration(format!(
                "initializer '{initializer}' must return a mapping, got {other}"
            ))),
        }
    }

    async fn serve(&mut self, mut transport: Transport) -> Result<(), PoolError> {
        loop {
            match self.queue.pop().await {
                Some(QueueItem::Task(task)) => {
                    if let Err(e) = self.execute(&mut transport, task).await {
                        self.transition(SlotState::Failed);
                        transport.abort().await;
                        self.transition(SlotState::Terminated);
                        return Err(e);
                    }
                }
                Some(QueueItem::Shutdown { wait }) => {
                    self.transition(SlotState::Draining);
                    let result = transport.shutdown(wait).await;
                    self.transition(SlotState::Terminated);
                    return match result {
                        Err(PoolError::ShutdownTimeout(grace)) => {
                            warn!(?grace, "process group was killed after the grace period");
                            Ok(())
                        }
                        other => other,
                    };
                }
                None => {
                    // queue drained by the broker after a pool-wide failure
                    self.transition(SlotState::Draining);
                    let result = transport.shutdown(false).await;
                    self.transition(SlotState::Terminated);
                    return result;
                }
            }
        }
    }

    /// Run one task. An error means the link is broken and the slot is done.
    async fn execute(&mut self, transport: &mut Transport, task: Task) -> Result<(), PoolError> {
        let Task { mut call, future } = task;
        if !future.set_running() {
            debug!(task = %future.id(), "skipping cancelled task");
            self.pool.task_cancelled();
            return Ok(());
        }
        self.transition(SlotState::Executing);
        self.pool.task_started();
        *self.progress.in_flight() = Some(future.clone());
        call.merge_defaults(&self.init_state);

        let function = call.function.clone();
        let outcome = transport.send_and_receive(future.id(), call).await;
        self.progress.in_flight().take();
        match outcome {
            Ok(Ok(value)) => {
                future.set_result(value);
                self.pool.task_finished(true);
            }
            Ok(Err(remote)) => {
                debug!(task = %future.id(), %function, error = %remote, "task raised");
                future.set_error(TaskError::Remote(remote));
                self.pool.task_finished(false);
            }
            Err(e) => {
                warn!(task = %future.id(), %function, error = %e, "lost contact with process group");
                future.set_error(TaskError::Communication(e.to_string()));
                self.pool.task_finished(false);
                return Err(e);
            }
        }
        self.transition(SlotState::Ready);
        Ok(())
    }

    fn transition(&mut self, next: SlotState) {
        debug!(from = ?self.state, to = ?next, "slot state");
        self.state = next;
    }

    fn bootup_error(&self, err: PoolError) -> PoolError {
        match err {
            PoolError::Bootup { .. } => err,
            other => PoolError::Bootup {
                slot: self.id,
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_task(pool: &PoolState, progress: &SlotProgress) -> TaskFuture {
        let future = TaskFuture::new();
        assert!(future.set_running());
        pool.task_started();
        *progress.in_flight() = Some(future.clone());
        future
    }

    #[tokio::test]
    async fn abandoned_slot_releases_counters_and_fails_its_task() {
        let pool = PoolState::new(1);
        let queue = TaskQueue::new();
        let progress = SlotProgress::default();
        progress.mark_ready(&pool);
        progress.settle(&pool);
        let running = running_task(&pool, &progress);
        let queued = TaskFuture::new();
        queue
            .push(QueueItem::Task(Task {
                call: Call::new("add"),
                future: queued.clone(),
            }))
            .unwrap();

        progress.abandon(&pool, &queue, PoolError::Supervisor("slot 0 panicked".into()));

        assert!(running.result().await.unwrap_err().is_communication());
        assert!(queued.result().await.unwrap_err().is_communication());
        let stats = pool.snapshot(queue.len());
        assert_eq!(stats.ready_slots, 0);
        assert_eq!(stats.alive_slots, 0);
        assert_eq!(stats.executing, 0);
        assert_eq!(stats.failed, 2);
        assert!(matches!(pool.take_failure(), Some(PoolError::Supervisor(_))));
        pool.all_settled().await;
    }

    #[tokio::test]
    async fn abandon_during_launch_settles_the_slot() {
        let pool = PoolState::new(2);
        let queue = TaskQueue::new();
        let first = SlotProgress::default();
        let second = SlotProgress::default();
        second.mark_ready(&pool);
        second.settle(&pool);

        first.abandon(&pool, &queue, PoolError::Supervisor("boom".into()));

        tokio::time::timeout(std::time::Duration::from_secs(1), pool.all_settled())
            .await
            .unwrap();
        assert_eq!(pool.snapshot(0).alive_slots, 1);
        assert_eq!(pool.snapshot(0).ready_slots, 1);
        assert!(!queue.is_closed());
    }

    #[test]
    fn counters_are_released_once() {
        let pool = PoolState::new(1);
        let queue = TaskQueue::new();
        let progress = SlotProgress::default();
        progress.mark_ready(&pool);
        progress.mark_gone(&pool);
        progress.exit(&pool, &queue);

        progress.abandon(&pool, &queue, PoolError::Supervisor("late".into()));

        let stats = pool.snapshot(0);
        assert_eq!(stats.alive_slots, 0);
        assert_eq!(stats.ready_slots, 0);
        assert!(pool.take_failure().is_some());
    }
}
