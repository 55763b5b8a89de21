use std::time::Duration;

use thiserror::Error;

use crate::protocol::RemoteError;

/// Errors raised by the pool, its worker slots and the wire layer.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("worker slot {slot} failed to boot: {reason}")]
    Bootup { slot: usize, reason: String },

    #[error("remote execution failed: {0}")]
    RemoteExecution(RemoteError),

    #[error("communication error: {0}")]
    Communication(String),

    #[error("worker did not exit within {0:?} of the shutdown request")]
    ShutdownTimeout(Duration),

    #[error("executor has been shut down")]
    ExecutorShutdown,

    #[error("task was cancelled")]
    Cancelled,

    #[error("no live worker slots remain")]
    NoLiveWorkers,

    #[error("broker supervisor failed: {0}")]
    Supervisor(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure stored in a [`TaskFuture`](crate::TaskFuture).
///
/// Cloneable so every reader of a future observes the same outcome.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    #[error("remote execution failed: {0}")]
    Remote(RemoteError),

    #[error("communication failure: {0}")]
    Communication(String),

    #[error("task was cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    pub fn is_communication(&self) -> bool {
        matches!(self, Self::Communication(_))
    }
}

impl From<TaskError> for PoolError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Remote(remote) => PoolError::RemoteExecution(remote),
            TaskError::Communication(msg) => PoolError::Communication(msg),
            TaskError::Cancelled => PoolError::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_error_converts_to_pool_error() {
        let remote = RemoteError::new("value_error", "boom");
        let err: PoolError = TaskError::Remote(remote.clone()).into();
        match err {
            PoolError::RemoteExecution(r) => assert_eq!(r, remote),
            other => panic!("expected RemoteExecution, got {other}"),
        }

        let err: PoolError = TaskError::Communication("eof".into()).into();
        assert!(matches!(err, PoolError::Communication(m) if m == "eof"));
    }

    #[test]
    fn cancelled_task_is_not_a_communication_error() {
        let err: PoolError = TaskError::Cancelled.into();
        assert!(matches!(err, PoolError::Cancelled));
        assert_eq!(err.to_string(), "task was cancelled");
    }

    #[test]
    fn bootup_display_names_slot() {
        let err = PoolError::Bootup {
            slot: 3,
            reason: "mpiexec not found".into(),
        };
        assert_eq!(
            err.to_string(),
            "worker slot 3 failed to boot: mpiexec not found"
        );
    }
}
