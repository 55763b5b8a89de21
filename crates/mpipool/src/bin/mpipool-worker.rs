//! mpipool-worker: backend entry point started by every launcher.
//!
//! Connects back to the controller, reports its rank (taken from the MPI,
//! SLURM or Flux environment) and executes built-in functions until told to
//! shut down.
//!
//! # Usage
//!
//! ```bash
//! mpiexec -n 2 mpipool-worker --host 127.0.0.1 --port 40123
//! ```

use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use mpipool::{builtin_registry, serve, RankInfo, WireCodec};

#[derive(Parser, Debug)]
#[command(name = "mpipool-worker", version, about)]
struct Cli {
    /// Controller address to connect to.
    #[arg(long)]
    host: IpAddr,

    /// Controller port to connect to.
    #[arg(long)]
    port: u16,

    /// Largest accepted wire frame in bytes.
    #[arg(long, env = "MPIPOOL_MAX_FRAME_BYTES", default_value_t = mpipool::codec::DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout belongs to the user's functions
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let rank = RankInfo::from_env();
    let registry = match builtin_registry() {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!(error = %e, "failed to build function registry");
            return ExitCode::FAILURE;
        }
    };
    info!(rank = rank.rank, size = rank.size, functions = registry.len(), "worker starting");

    let endpoint = SocketAddr::new(cli.host, cli.port);
    match serve(registry, endpoint, WireCodec::new(cli.max_frame_bytes), rank).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(rank = rank.rank, error = %e, "worker stopped");
            ExitCode::FAILURE
        }
    }
}
