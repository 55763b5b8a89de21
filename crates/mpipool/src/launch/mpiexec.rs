use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use super::{command_from_argv, LaunchHandle, ProcessGroup, WorkerCommand};
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::traits::Launcher;

/// Starts every worker slot with `mpiexec -n <cores>`.
#[derive(Debug, Clone)]
pub struct MpiExecLauncher {
    cores: usize,
    oversubscribe: bool,
    cwd: Option<PathBuf>,
}

impl MpiExecLauncher {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            cores: config.cores_per_worker,
            oversubscribe: config.oversubscribe,
            cwd: config.working_directory.clone(),
        }
    }

    /// Full argv for one slot.
    pub fn command_line(&self, command: &WorkerCommand) -> Vec<String> {
        let mut argv = vec!["mpiexec".to_string(), "-n".to_string(), self.cores.to_string()];
        if self.oversubscribe {
            argv.push("--oversubscribe".into());
        }
        argv.extend(command.argv());
        argv
    }
}

#[async_trait]
impl Launcher for MpiExecLauncher {
    fn name(&self) -> &str {
        "mpiexec"
    }

    fn ranks(&self) -> usize {
        self.cores
    }

    async fn bootup(&self, command: &WorkerCommand) -> Result<LaunchHandle, PoolError> {
        let argv = self.command_line(command);
        info!(cores = self.cores, program = %command.program.display(), "starting mpiexec");
        let cmd = command_from_argv(&argv, self.cwd.as_deref())?;
        Ok(LaunchHandle::Processes(ProcessGroup::spawn(vec![cmd])?))
    }
}
