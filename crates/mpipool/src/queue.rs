//! Shared FIFO between the executor and its worker slots.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;

use crate::future::TaskFuture;
use crate::protocol::Call;

/// A submitted call and the future that receives its outcome.
#[derive(Debug)]
pub struct Task {
    pub call: Call,
    pub future: TaskFuture,
}

#[derive(Debug)]
pub enum QueueItem {
    Task(Task),
    /// Sentinel telling one worker slot to stop.
    Shutdown { wait: bool },
}

#[derive(Debug, Default)]
struct QueueInner {
    items: VecDeque<QueueItem>,
    closed: bool,
}

/// Multi-consumer task queue.
///
/// Once closed, pushes are refused but items already queued (including
/// shutdown sentinels) are still handed out.
#[derive(Debug, Default)]
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item. Hands it back if the queue is closed.
    pub fn push(&self, item: QueueItem) -> Result<(), QueueItem> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(item);
            }
            inner.items.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next item. `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<QueueItem> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    let more = !inner.items.is_empty();
                    drop(inner);
                    if more {
                        // pass the wakeup on to another consumer
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Close the queue and enqueue one shutdown sentinel per slot.
    ///
    /// With `cancel`, tasks still waiting are removed and returned so the
    /// caller can cancel their futures; otherwise they stay ahead of the
    /// sentinels and are executed first.
    pub fn close_with_shutdown(&self, slots: usize, wait: bool, cancel: bool) -> Vec<Task> {
        let drained = {
            let mut inner = self.lock();
            let drained = if cancel {
                drain_tasks(&mut inner.items)
            } else {
                Vec::new()
            };
            if !inner.closed {
                inner.closed = true;
                for _ in 0..slots {
                    inner.items.push_back(QueueItem::Shutdown { wait });
                }
            }
            drained
        };
        self.notify.notify_waiters();
        drained
    }

    /// Close the queue and remove everything in it.
    pub fn close_and_drain(&self) -> Vec<Task> {
        let drained = {
            let mut inner = self.lock();
            inner.closed = true;
            let tasks = drain_tasks(&mut inner.items);
            inner.items.clear();
            tasks
        };
        self.notify.notify_waiters();
        drained
    }
}

fn drain_tasks(items: &mut VecDeque<QueueItem>) -> Vec<Task> {
    let mut tasks = Vec::new();
    let mut kept = VecDeque::with_capacity(items.len());
    for item in items.drain(..) {
        match item {
            QueueItem::Task(task) => tasks.push(task),
            sentinel => kept.push_back(sentinel),
        }
    }
    *items = kept;
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn task(name: &str) -> QueueItem {
        QueueItem::Task(Task {
            call: Call::new(name),
            future: TaskFuture::new(),
        })
    }

    fn name(item: QueueItem) -> String {
        match item {
            QueueItem::Task(t) => t.call.function,
            QueueItem::Shutdown { .. } => "shutdown".into(),
        }
    }

    #[tokio::test]
    async fn fifo_order() {
        let queue = TaskQueue::new();
        queue.push(task("a")).unwrap();
        queue.push(task("b")).unwrap();
        assert_eq!(name(queue.pop().await.unwrap()), "a");
        assert_eq!(name(queue.pop().await.unwrap()), "b");
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = Arc::new(TaskQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await.map(name) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(task("late")).unwrap();
        assert_eq!(consumer.await.unwrap().as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn shutdown_sentinels_follow_pending_tasks() {
        let queue = TaskQueue::new();
        queue.push(task("a")).unwrap();
        let cancelled = queue.close_with_shutdown(2, true, false);
        assert!(cancelled.is_empty());
        assert!(queue.push(task("rejected")).is_err());

        assert_eq!(name(queue.pop().await.unwrap()), "a");
        assert_eq!(name(queue.pop().await.unwrap()), "shutdown");
        assert_eq!(name(queue.pop().await.unwrap()), "shutdown");
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn cancel_removes_pending_tasks() {
        let queue = TaskQueue::new();
        queue.push(task("a")).unwrap();
        queue.push(task("b")).unwrap();
        let cancelled = queue.close_with_shutdown(1, false, true);
        assert_eq!(cancelled.len(), 2);
        assert_eq!(name(queue.pop().await.unwrap()), "shutdown");
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn close_wakes_waiting_consumers() {
        let queue = Arc::new(TaskQueue::new());
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.pop().await.is_none() })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.close_and_drain().is_empty());
        for consumer in consumers {
            assert!(consumer.await.unwrap());
        }
    }
}
