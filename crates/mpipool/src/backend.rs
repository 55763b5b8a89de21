//! Worker-side entry point: connect to the controller and run calls.
//!
//! Every rank of a launched process group runs [`serve`]: it connects to the
//! endpoint passed on its command line, introduces itself with its rank, then
//! executes each [`Request::Call`] against a [`FunctionRegistry`] until it
//! receives [`Request::Shutdown`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::io::BufStream;
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

use crate::broker::panic_message;
use crate::codec::WireCodec;
use crate::error::PoolError;
use crate::protocol::{RemoteError, Reply, Request};

/// Arguments of one call as seen by a registered function.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub rank: u32,
    pub size: u32,
}

impl Invocation {
    /// Positional argument `index`, if given.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }
}

/// A function callable by name from the controller.
pub type WorkerFunction = Arc<dyn Fn(Invocation) -> anyhow::Result<Value> + Send + Sync>;

/// Named functions a worker can execute.
pub struct FunctionRegistry {
    functions: HashMap<String, WorkerFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Register a function. Returns error if name already registered.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F) -> Result<(), RegistryError>
    where
        F: Fn(Invocation) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.functions.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }
        self.functions.insert(name, Arc::new(function));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<WorkerFunction> {
        self.functions.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("function '{0}' is already registered")]
    DuplicateName(String),
}

/// Rank and world size of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankInfo {
    pub rank: u32,
    pub size: u32,
}

const RANK_VARS: &[(&str, &str)] = &[
    ("MPIPOOL_RANK", "MPIPOOL_WORLD_SIZE"),
    ("OMPI_COMM_WORLD_RANK", "OMPI_COMM_WORLD_SIZE"),
    ("PMIX_RANK", "PMI_SIZE"),
    ("PMI_RANK", "PMI_SIZE"),
    ("SLURM_PROCID", "SLURM_NTASKS"),
    ("FLUX_TASK_RANK", "FLUX_JOB_SIZE"),
];

impl RankInfo {
    /// Read rank and size from the launcher's environment variables,
    /// defaulting to rank 0 of 1.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        for (rank_var, size_var) in RANK_VARS {
            if let Some(rank) = lookup(rank_var).and_then(|v| v.trim().parse().ok()) {
                let size = lookup(size_var)
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(rank + 1);
                return Self { rank, size };
            }
        }
        Self { rank: 0, size: 1 }
    }
}

/// Connect to `endpoint` and serve calls until shut down.
///
/// Returns `Ok(())` after a shutdown request and an error if the controller
/// disappears first.
#[instrument(skip(registry, codec, rank), fields(rank = rank.rank))]
pub async fn serve(
    registry: Arc<FunctionRegistry>,
    endpoint: SocketAddr,
    codec: WireCodec,
    rank: RankInfo,
) -> Result<(), PoolError> {
    let socket = TcpStream::connect(endpoint).await?;
    socket.set_nodelay(true)?;
    let mut stream = BufStream::new(socket);
    codec
        .write_frame(
            &mut stream,
            &Reply::Hello {
                rank: rank.rank,
                size: rank.size,
            },
        )
        .await?;
    info!(%endpoint, size = rank.size, "connected to controller");

    loop {
        let request: Request = codec.read_frame(&mut stream).await?.ok_or_else(|| {
            PoolError::Communication("controller closed the connection".into())
        })?;
        match request {
            Request::Call {
                id,
                function,
                args,
                kwargs,
            } => {
                debug!(task = %id, %function, "executing");
                let reply = match execute(&registry, &function, args, kwargs, rank).await {
                    Ok(value) => Reply::Result { id, value },
                    Err(error) => {
                        debug!(task = %id, %function, %error, "call failed");
                        Reply::Error { id, error }
                    }
                };
                codec.write_frame(&mut stream, &reply).await?;
            }
            Request::Shutdown { wait } => {
                info!(wait, "shutdown requested");
                return Ok(());
            }
        }
    }
}

/// Run one call on the blocking pool so long computations do not stall the
/// connection task.
async fn execute(
    registry: &FunctionRegistry,
    function: &str,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    rank: RankInfo,
) -> Result<Value, RemoteError> {
    let Some(callable) = registry.get(function) else {
        warn!(%function, "unknown function");
        return Err(RemoteError::new(
            "unknown_function",
            format!("no function registered under '{function}'"),
        ));
    };
    let invocation = Invocation {
        args,
        kwargs,
        rank: rank.rank,
        size: rank.size,
    };
    match tokio::task::spawn_blocking(move || callable(invocation)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(RemoteError::new("error", format!("{e:#}"))),
        Err(e) if e.is_panic() => Err(RemoteError::new(
            "panic",
            panic_message(e.into_panic().as_ref()),
        )),
        Err(e) => Err(RemoteError::new("cancelled", e.to_string())),
    }
}
