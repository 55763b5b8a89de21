//! Broker: starts the worker slots and supervises their lifetimes.
//!
//! Slots race for tasks on the shared [`TaskQueue`]; the broker never places
//! tasks itself. Slots record their own fatal failures in [`PoolState`] for
//! the executor to re-raise. A slot task that panics is caught here and its
//! [`SlotProgress`] abandoned: the running task fails, the counters it held
//! are released and the panic is recorded. Once the last slot is gone, any
//! leftover tasks are failed.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::PoolConfig;
use crate::error::{PoolError, TaskError};
use crate::queue::TaskQueue;
use crate::slot::{SlotProgress, WorkerSlot};
use crate::traits::Launcher;

/// Counters shared by the executor, the broker and every slot.
#[derive(Debug)]
pub(crate) struct PoolState {
    max_workers: usize,
    alive: AtomicUsize,
    ready: AtomicUsize,
    /// Slots that have left `Launching`, successfully or not.
    settled: watch::Sender<usize>,
    executing: AtomicUsize,
    peak_executing: AtomicUsize,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    failures: Mutex<VecDeque<PoolError>>,
}

impl PoolState {
    pub(crate) fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            alive: AtomicUsize::new(max_workers),
            ready: AtomicUsize::new(0),
            settled: watch::Sender::new(0),
            executing: AtomicUsize::new(0),
            peak_executing: AtomicUsize::new(0),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn alive(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    /// Mark one slot as exited; returns how many remain.
    pub(crate) fn slot_exited(&self) -> usize {
        self.alive.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    pub(crate) fn slot_ready(&self) {
        self.ready.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn slot_gone(&self) {
        self.ready.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn slot_settled(&self) {
        self.settled.send_modify(|n| *n += 1);
    }

    /// Wait until every slot has left `Launching`.
    pub(crate) async fn all_settled(&self) {
        let mut rx = self.settled.subscribe();
        let target = self.max_workers;
        // sender is owned by self, the channel stays open
        let _ = rx.wait_for(|n| *n >= target).await;
    }

    pub(crate) fn task_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_started(&self) {
        let now = self.executing.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_executing.fetch_max(now, Ordering::SeqCst);
    }

    pub(crate) fn task_finished(&self, ok: bool) {
        self.executing.fetch_sub(1, Ordering::SeqCst);
        if ok {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn task_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    fn failures(&self) -> std::sync::MutexGuard<'_, VecDeque<PoolError>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn record_failure(&self, err: PoolError) {
        self.failures().push_back(err);
    }

    /// Oldest unreported failure. Each failure is handed out once.
    pub(crate) fn take_failure(&self) -> Option<PoolError> {
        self.failures().pop_front()
    }

    pub(crate) fn snapshot(&self, queued: usize) -> PoolStats {
        PoolStats {
            max_workers: self.max_workers,
            alive_slots: self.alive(),
            ready_slots: self.ready.load(Ordering::SeqCst),
            queued,
            executing: self.executing.load(Ordering::SeqCst),
            peak_executing: self.peak_executing.load(Ordering::SeqCst),
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the pool, from [`Executor::stats`](crate::Executor::stats).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_workers: usize,
    /// Slots whose task has not finished yet (launching, serving or draining).
    pub alive_slots: usize,
    /// Slots with a connected process group.
    pub ready_slots: usize,
    pub queued: usize,
    pub executing: usize,
    /// Highest number of tasks executed at the same time.
    pub peak_executing: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

pub(crate) struct Broker {
    config: Arc<PoolConfig>,
    launcher: Arc<dyn Launcher>,
    queue: Arc<TaskQueue>,
    pool: Arc<PoolState>,
}

impl Broker {
    pub(crate) fn new(
        config: Arc<PoolConfig>,
        launcher: Arc<dyn Launcher>,
        queue: Arc<TaskQueue>,
        pool: Arc<PoolState>,
    ) -> Self {
        Self {
            config,
            launcher,
            queue,
            pool,
        }
    }

    async fn run(self) {
        info!(
            max_workers = self.config.max_workers,
            backend = self.launcher.name(),
            ranks = self.launcher.ranks(),
            "starting worker slots"
        );
        let mut slots = JoinSet::new();
        for id in 0..self.config.max_workers {
            let progress = Arc::new(SlotProgress::default());
            let slot = WorkerSlot::new(
                id,
                Arc::clone(&self.config),
                Arc::clone(&self.launcher),
                Arc::clone(&self.queue),
                Arc::clone(&self.pool),
                Arc::clone(&progress),
            );
            let queue = Arc::clone(&self.queue);
            let pool = Arc::clone(&self.pool);
            slots.spawn(async move {
                if let Err(panic) = AssertUnwindSafe(slot.run()).catch_unwind().await {
                    let message = panic_message(panic.as_ref());
                    error!(slot = id, %message, "worker slot panicked");
                    progress.abandon(
                        &pool,
                        &queue,
                        PoolError::Supervisor(format!("worker slot {id} panicked: {message}")),
                    );
                }
            });
        }

        while let Some(joined) = slots.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker slot task aborted");
                self.pool
                    .record_failure(PoolError::Supervisor(format!("worker slot task: {e}")));
            }
        }
        info!("all worker slots joined");
    }
}

/// Run the broker, capturing a panic as a recorded failure instead of
/// letting it vanish with the task. `done` flips to `true` once every slot
/// has been joined.
pub(crate) async fn supervise(broker: Broker, done: watch::Sender<bool>) {
    let queue = Arc::clone(&broker.queue);
    let pool = Arc::clone(&broker.pool);
    if let Err(panic) = AssertUnwindSafe(broker.run()).catch_unwind().await {
        let message = panic_message(panic.as_ref());
        error!(%message, "broker panicked");
        pool.record_failure(PoolError::Supervisor(message));
        fail_orphaned_tasks(&queue, &pool);
    }
    done.send_replace(true);
}

/// Close the queue and fail whatever is left in it.
pub(crate) fn fail_orphaned_tasks(queue: &TaskQueue, pool: &PoolState) {
    let orphaned = queue.close_and_drain();
    if orphaned.is_empty() {
        return;
    }
    warn!(tasks = orphaned.len(), "failing tasks left without a worker slot");
    for task in orphaned {
        if task
            .future
            .set_error(TaskError::Communication(PoolError::NoLiveWorkers.to_string()))
        {
            pool.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::TaskFuture;
    use crate::protocol::Call;
    use crate::queue::{QueueItem, Task};

    #[test]
    fn failures_are_reported_once_in_order() {
        let pool = PoolState::new(2);
        pool.record_failure(PoolError::NoLiveWorkers);
        pool.record_failure(PoolError::Communication("eof".into()));

        assert!(matches!(pool.take_failure(), Some(PoolError::NoLiveWorkers)));
        assert!(matches!(pool.take_failure(), Some(PoolError::Communication(_))));
        assert!(pool.take_failure().is_none());
    }

    #[test]
    fn peak_tracks_concurrency() {
        let pool = PoolState::new(4);
        pool.task_started();
        pool.task_started();
        pool.task_finished(true);
        pool.task_started();
        pool.task_finished(false);
        pool.task_finished(true);

        let stats = pool.snapshot(0);
        assert_eq!(stats.peak_executing, 2);
        assert_eq!(stats.executing, 0);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn orphaned_tasks_fail_with_communication_error() {
        let queue = TaskQueue::new();
        let pool = PoolState::new(1);
        let future = TaskFuture::new();
        queue
            .push(QueueItem::Task(Task {
                call: Call::new("add"),
                future: future.clone(),
            }))
            .unwrap();

        fail_orphaned_tasks(&queue, &pool);

        let err = future.result().await.unwrap_err();
        assert!(err.is_communication());
        assert!(queue.is_closed());
        assert_eq!(pool.snapshot(0).failed, 1);
    }

    #[test]
    fn panic_payloads_become_messages() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
