use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use super::{command_from_argv, LaunchHandle, ProcessGroup, WorkerCommand};
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::traits::Launcher;

/// Starts every worker slot as a SLURM job step.
#[derive(Debug, Clone)]
pub struct SrunLauncher {
    cores: usize,
    threads_per_core: usize,
    gpus_per_core: usize,
    oversubscribe: bool,
    cwd: Option<PathBuf>,
}

impl SrunLauncher {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            cores: config.cores_per_worker,
            threads_per_core: config.threads_per_core,
            gpus_per_core: config.gpus_per_core(),
            oversubscribe: config.oversubscribe,
            cwd: config.working_directory.clone(),
        }
    }

    /// Full argv for one slot.
    pub fn command_line(&self, command: &WorkerCommand) -> Vec<String> {
        let mut argv = vec!["srun".to_string(), "-n".to_string(), self.cores.to_string()];
        if let Some(cwd) = &self.cwd {
            argv.push("-D".into());
            argv.push(cwd.to_string_lossy().into_owned());
        }
        if self.threads_per_core > 1 {
            argv.push(format!("--cpus-per-task={}", self.threads_per_core));
        }
        if self.gpus_per_core > 0 {
            argv.push(format!("--gpus-per-task={}", self.gpus_per_core));
        }
        if self.oversubscribe {
            argv.push("--oversubscribe".into());
        }
        argv.extend(command.argv());
        argv
    }
}

#[async_trait]
impl Launcher for SrunLauncher {
    fn name(&self) -> &str {
        "srun"
    }

    fn ranks(&self) -> usize {
        self.cores
    }

    async fn bootup(&self, command: &WorkerCommand) -> Result<LaunchHandle, PoolError> {
        let argv = self.command_line(command);
        info!(
            cores = self.cores,
            threads = self.threads_per_core,
            gpus = self.gpus_per_core,
            "starting srun job step"
        );
        // srun applies -D itself
        let cmd = command_from_argv(&argv, None)?;
        Ok(LaunchHandle::Processes(ProcessGroup::spawn(vec![cmd])?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;

    #[test]
    fn minimal_command_line() {
        let cfg = PoolConfig::new(1).backend(BackendKind::Srun);
        let argv = SrunLauncher::from_config(&cfg).command_line(&WorkerCommand::new("w"));
        assert_eq!(argv, vec!["srun", "-n", "1", "w"]);
    }

    #[test]
    fn resources_map_to_flags() {
        let cfg = PoolConfig::new(1)
            .backend(BackendKind::Srun)
            .cores_per_worker(2)
            .threads_per_core(4)
            .gpus_per_worker(2)
            .oversubscribe(true)
            .working_directory("/scratch");
        let argv = SrunLauncher::from_config(&cfg).command_line(&WorkerCommand::new("w"));
        assert_eq!(
            argv,
            vec![
                "srun",
                "-n",
                "2",
                "-D",
                "/scratch",
                "--cpus-per-task=4",
                "--gpus-per-task=1",
                "--oversubscribe",
                "w"
            ]
        );
    }
}
