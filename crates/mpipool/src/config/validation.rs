use crate::error::PoolError;

use super::types::{BackendKind, PoolConfig};

impl PoolConfig {
    /// Validate the resource specification for the selected backend.
    pub fn validate(&self) -> Result<(), PoolError> {
        self.validate_counts()?;
        self.validate_gpu_split()?;
        self.validate_backend_resources()?;
        self.validate_poll_interval()?;
        Ok(())
    }

    fn validate_counts(&self) -> Result<(), PoolError> {
        for (name, value) in [
            ("max_workers", self.max_workers),
            ("cores_per_worker", self.cores_per_worker),
            ("threads_per_core", self.threads_per_core),
        ] {
            if value < 1 {
                return Err(PoolError::Configuration(format!(
                    "{name} must be at least 1, got {value}"
                )));
            }
        }
        Ok(())
    }

    fn validate_gpu_split(&self) -> Result<(), PoolError> {
        if self.gpus_per_worker % self.cores_per_worker != 0 {
            return Err(PoolError::Configuration(format!(
                "gpus_per_worker ({}) must be a multiple of cores_per_worker ({})",
                self.gpus_per_worker, self.cores_per_worker
            )));
        }
        Ok(())
    }

    /// `mpiexec` cannot bind threads or GPUs; `local` cannot bind GPUs.
    fn validate_backend_resources(&self) -> Result<(), PoolError> {
        match self.backend {
            BackendKind::Mpiexec => {
                if self.threads_per_core != 1 {
                    return Err(PoolError::Configuration(
                        "the mpiexec backend only supports threads_per_core = 1, \
                         use the srun or flux backend to manage threads"
                            .into(),
                    ));
                }
                if self.gpus_per_worker != 0 {
                    return Err(PoolError::Configuration(
                        "the mpiexec backend only supports gpus_per_worker = 0, \
                         use the srun or flux backend to manage GPUs"
                            .into(),
                    ));
                }
            }
            BackendKind::Local => {
                if self.gpus_per_worker != 0 {
                    return Err(PoolError::Configuration(
                        "the local backend cannot bind GPUs, gpus_per_worker must be 0".into(),
                    ));
                }
            }
            BackendKind::Srun | BackendKind::Flux => {}
        }
        Ok(())
    }

    fn validate_poll_interval(&self) -> Result<(), PoolError> {
        if self.backend == BackendKind::Flux && self.poll_interval_ms == 0 {
            return Err(PoolError::Configuration(
                "poll_interval_ms must be positive for the flux backend".into(),
            ));
        }
        Ok(())
    }
}
