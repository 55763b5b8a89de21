pub mod backend;
pub mod broker;
pub mod builtins;
pub mod codec;
pub mod config;
pub mod error;
pub mod executor;
pub mod future;
pub mod launch;
pub mod protocol;
pub(crate) mod queue;
pub mod slot;
pub mod traits;
pub mod transport;

pub use backend::{serve, FunctionRegistry, Invocation, RankInfo, RegistryError, WorkerFunction};
pub use broker::PoolStats;
pub use builtins::builtin_registry;
pub use codec::WireCodec;
pub use config::{BackendKind, PoolConfig};
pub use error::{PoolError, TaskError};
pub use executor::Executor;
pub use future::{FutureState, TaskFuture};
pub use launch::{
    build_launcher, FluxCli, FluxLauncher, JobHandle, JobId, JobSpec, JobState, LaunchHandle,
    LocalLauncher, MpiExecLauncher, ProcessGroup, SrunLauncher, WorkerCommand,
};
pub use protocol::{Call, RemoteError, Reply, Request};
pub use slot::SlotState;
pub use traits::{JobScheduler, Launcher};
pub use transport::Transport;

pub use serde_json::Value;
