//! Wire messages exchanged between the controller and worker ranks.
//!
//! Bodies are MessagePack (named fields) inside length-prefixed frames, see
//! [`crate::codec::WireCodec`]. A callable travels as the name it was
//! registered under in the worker's [`FunctionRegistry`](crate::FunctionRegistry).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Request sent from the controller to every rank of a process group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    /// Execute a registered function.
    Call {
        id: Uuid,
        function: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Map<String, Value>,
    },

    /// Leave the serve loop and exit with status 0.
    Shutdown { wait: bool },
}

/// Frame sent from a rank back to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    /// First frame after connecting; identifies the rank.
    Hello { rank: u32, size: u32 },

    /// Successful execution.
    Result { id: Uuid, value: Value },

    /// The function failed on this rank.
    Error { id: Uuid, error: RemoteError },
}

/// Failure raised inside a worker while executing a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Short machine-readable category (`unknown_function`, `panic`, ...).
    pub kind: String,
    /// Human-readable message carried from the worker.
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A callable plus its arguments, as submitted to the executor.
///
/// # Example
/// ```ignore
/// let call = Call::new("add").arg(2).arg(3);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub function: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl Call {
    /// Start a call of the function registered under `function`.
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Replace the positional arguments.
    pub fn args(mut self, args: impl IntoIterator<Item = Value>) -> Self {
        self.args = args.into_iter().collect();
        self
    }

    /// Set a keyword argument.
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Merge per-slot initializer state into the keyword arguments.
    ///
    /// Keys supplied explicitly on the call win over initializer keys.
    pub(crate) fn merge_defaults(&mut self, defaults: &Map<String, Value>) {
        for (key, value) in defaults {
            if !self.kwargs.contains_key(key) {
                self.kwargs.insert(key.clone(), value.clone());
            }
        }
    }

    pub(crate) fn into_request(self, id: Uuid) -> Request {
        Request::Call {
            id,
            function: self.function,
            args: self.args,
            kwargs: self.kwargs,
        }
    }
}
