//! Result handles returned by [`Executor::submit`](crate::Executor::submit).

use std::future::IntoFuture;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::TaskError;

/// Lifecycle of a submitted task.
#[derive(Debug, Clone, PartialEq)]
pub enum FutureState {
    /// Queued, not yet picked up by a worker slot.
    Pending,
    /// Sent to a process group.
    Running,
    Done(Value),
    Errored(TaskError),
    Cancelled,
}

impl FutureState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Completion handle for one task.
///
/// Clones observe the same task. A result is set at most once; later
/// attempts are ignored.
#[derive(Debug, Clone)]
pub struct TaskFuture {
    id: Uuid,
    state: Arc<watch::Sender<FutureState>>,
}

impl TaskFuture {
    pub(crate) fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: Arc::new(watch::Sender::new(FutureState::Pending)),
        }
    }

    /// Task id, also used as the wire request id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> FutureState {
        self.state.borrow().clone()
    }

    pub fn done(&self) -> bool {
        self.state.borrow().is_finished()
    }

    pub fn running(&self) -> bool {
        matches!(*self.state.borrow(), FutureState::Running)
    }

    pub fn cancelled(&self) -> bool {
        matches!(*self.state.borrow(), FutureState::Cancelled)
    }

    /// Cancel the task if no worker slot has picked it up yet.
    ///
    /// Returns `true` if the task is (now) cancelled.
    pub fn cancel(&self) -> bool {
        self.state.send_if_modified(|state| match state {
            FutureState::Pending => {
                *state = FutureState::Cancelled;
                true
            }
            _ => false,
        });
        self.cancelled()
    }

    /// Move from pending to running. Fails if the task was cancelled.
    pub(crate) fn set_running(&self) -> bool {
        self.state.send_if_modified(|state| match state {
            FutureState::Pending => {
                *state = FutureState::Running;
                true
            }
            _ => false,
        })
    }

    pub(crate) fn set_result(&self, value: Value) -> bool {
        self.finish(FutureState::Done(value))
    }

    pub(crate) fn set_error(&self, error: TaskError) -> bool {
        self.finish(FutureState::Errored(error))
    }

    fn finish(&self, outcome: FutureState) -> bool {
        self.state.send_if_modified(move |state| {
            if state.is_finished() {
                return false;
            }
            *state = outcome;
            true
        })
    }

    /// Wait for the task to finish.
    pub async fn result(&self) -> Result<Value, TaskError> {
        let mut rx = self.state.subscribe();
        // the sender lives in self, so the channel cannot close while we wait
        let state = match rx.wait_for(FutureState::is_finished).await {
            Ok(state) => state.clone(),
            Err(_) => return Err(TaskError::Cancelled),
        };
        match state {
            FutureState::Done(value) => Ok(value),
            FutureState::Errored(error) => Err(error),
            _ => Err(TaskError::Cancelled),
        }
    }
}

impl IntoFuture for TaskFuture {
    type Output = Result<Value, TaskError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.result().await })
    }
}
