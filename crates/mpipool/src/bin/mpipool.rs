//! mpipool: run registered functions on a pool of MPI worker groups.
//!
//! # Usage
//!
//! ```bash
//! # Single call on a local pool of two workers
//! mpipool --backend local --max-workers 2 submit add 2 3
//!
//! # One call per argument list, results printed in submission order
//! mpipool --config pool.toml map sleep '[[0.1, "a"], [0.2, "b"]]'
//!
//! # Show the effective configuration after env overrides and flags
//! mpipool --config pool.toml check-config
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::{Map, Value};
use tracing::info;

use mpipool::{BackendKind, Call, Executor, PoolConfig, PoolError};

#[derive(Parser, Debug)]
#[command(name = "mpipool", version, about)]
struct Cli {
    /// Pool configuration file (TOML).
    #[arg(long, env = "MPIPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Number of worker groups.
    #[arg(long)]
    max_workers: Option<usize>,

    /// Ranks per worker group.
    #[arg(long)]
    cores_per_worker: Option<usize>,

    /// Threads per rank.
    #[arg(long)]
    threads_per_core: Option<usize>,

    /// GPUs per worker group.
    #[arg(long)]
    gpus_per_worker: Option<usize>,

    /// Launch backend: mpiexec, srun, flux or local.
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Allow more ranks than available cores.
    #[arg(long)]
    oversubscribe: bool,

    /// Working directory of the worker processes.
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Worker entry point (defaults to mpipool-worker next to this binary).
    #[arg(long)]
    worker_program: Option<PathBuf>,

    /// Registered function run once per worker at startup.
    #[arg(long)]
    initializer: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one call and print its result.
    Submit {
        function: String,
        /// Positional arguments, each parsed as JSON (bare words become strings).
        args: Vec<String>,
        /// Keyword argument as key=json, repeatable.
        #[arg(long = "kwarg", value_name = "KEY=JSON")]
        kwargs: Vec<String>,
    },
    /// Run one call per argument list and print results in order.
    Map {
        function: String,
        /// JSON array of argument arrays.
        inputs: String,
    },
    /// Validate the configuration and print it.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    match cli.command {
        Command::CheckConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
        Command::Submit {
            function,
            args,
            kwargs,
        } => {
            let mut call = Call::new(function).args(args.iter().map(|a| parse_value(a)));
            for (key, value) in parse_kwargs(&kwargs)? {
                call = call.kwarg(key, value);
            }
            info!(function = %call.function, "submitting");
            let value = Executor::scoped(config, |exe| async move {
                let future = exe.submit(call)?;
                Ok(future.await?)
            })
            .await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Command::Map { function, inputs } => {
            let inputs: Vec<Vec<Value>> = serde_json::from_str(&inputs)
                .context("map inputs must be a JSON array of argument arrays")?;
            let results = Executor::scoped(config, |exe| async move {
                let stream = exe.map(&function, inputs)?;
                let results: Vec<_> = stream.collect().await;
                Ok::<_, PoolError>(results)
            })
            .await?;
            let mut failed = 0;
            for result in results {
                match result {
                    Ok(value) => println!("{}", serde_json::to_string(&value)?),
                    Err(e) => {
                        failed += 1;
                        println!("{}", serde_json::json!({ "error": e.to_string() }));
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} call(s) failed");
            }
        }
    }
    Ok(())
}

fn resolve_config(cli: &Cli) -> Result<PoolConfig> {
    let mut config = match &cli.config {
        Some(path) => PoolConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => {
            let mut config = PoolConfig::default();
            config.apply_env_overrides();
            config
        }
    };

    if let Some(v) = cli.max_workers {
        config.max_workers = v;
    }
    if let Some(v) = cli.cores_per_worker {
        config.cores_per_worker = v;
    }
    if let Some(v) = cli.threads_per_core {
        config.threads_per_core = v;
    }
    if let Some(v) = cli.gpus_per_worker {
        config.gpus_per_worker = v;
    }
    if let Some(v) = cli.backend {
        config.backend = v;
    }
    if cli.oversubscribe {
        config.oversubscribe = true;
    }
    if let Some(v) = &cli.cwd {
        config.working_directory = Some(v.clone());
    }
    if let Some(v) = &cli.worker_program {
        config.worker_program = Some(v.clone());
    }
    if let Some(v) = &cli.initializer {
        config.initializer = Some(v.clone());
    }

    config.validate()?;
    Ok(config)
}

/// JSON if it parses, otherwise the raw text as a string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_kwargs(raw: &[String]) -> Result<Map<String, Value>> {
    let mut kwargs = Map::new();
    for entry in raw {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("keyword argument '{entry}' must look like key=json");
        };
        kwargs.insert(key.to_string(), parse_value(value));
    }
    Ok(kwargs)
}
