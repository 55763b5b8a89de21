use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use super::{command_from_argv, LaunchHandle, ProcessGroup, WorkerCommand};
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::traits::Launcher;

/// Starts one plain child process per rank, without an MPI launcher.
///
/// Each child learns its rank from `MPIPOOL_RANK` / `MPIPOOL_WORLD_SIZE`.
#[derive(Debug, Clone)]
pub struct LocalLauncher {
    cores: usize,
    threads_per_core: usize,
    cwd: Option<PathBuf>,
}

impl LocalLauncher {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            cores: config.cores_per_worker,
            threads_per_core: config.threads_per_core,
            cwd: config.working_directory.clone(),
        }
    }

    /// Environment given to the child running `rank`.
    pub fn rank_environment(&self, rank: usize) -> Vec<(String, String)> {
        vec![
            ("MPIPOOL_RANK".into(), rank.to_string()),
            ("MPIPOOL_WORLD_SIZE".into(), self.cores.to_string()),
            ("OMP_NUM_THREADS".into(), self.threads_per_core.to_string()),
        ]
    }
}

#[async_trait]
impl Launcher for LocalLauncher {
    fn name(&self) -> &str {
        "local"
    }

    fn ranks(&self) -> usize {
        self.cores
    }

    async fn bootup(&self, command: &WorkerCommand) -> Result<LaunchHandle, PoolError> {
        let argv = command.argv();
        let mut commands = Vec::with_capacity(self.cores);
        for rank in 0..self.cores {
            let mut cmd = command_from_argv(&argv, self.cwd.as_deref())?;
            cmd.envs(self.rank_environment(rank));
            commands.push(cmd);
        }
        let group = ProcessGroup::spawn(commands)?;
        info!(ranks = group.len(), pids = ?group.pids(), "started local worker processes");
        Ok(LaunchHandle::Processes(group))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;

    #[test]
    fn rank_environment_names_rank_and_size() {
        let cfg = PoolConfig::new(1)
            .backend(BackendKind::Local)
            .cores_per_worker(3)
            .threads_per_core(2);
        let env = LocalLauncher::from_config(&cfg).rank_environment(1);
        assert_eq!(
            env,
            vec![
                ("MPIPOOL_RANK".to_string(), "1".to_string()),
                ("MPIPOOL_WORLD_SIZE".to_string(), "3".to_string()),
                ("OMP_NUM_THREADS".to_string(), "2".to_string()),
            ]
        );
    }
}
