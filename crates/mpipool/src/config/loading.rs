use std::path::{Path, PathBuf};

use crate::error::PoolError;

use super::types::PoolConfig;

/// File name of the bundled worker entry point.
pub(crate) const WORKER_BINARY: &str = "mpipool-worker";

impl PoolConfig {
    /// Parse config from a TOML string, apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, PoolError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PoolError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Resolve the entry-point executable the launchers start.
    pub fn resolved_worker_program(&self) -> Result<PathBuf, PoolError> {
        if let Some(program) = &self.worker_program {
            return Ok(program.clone());
        }

        let exe = std::env::current_exe()?;
        let mut dir = exe
            .parent()
            .ok_or_else(|| PoolError::Configuration("current executable has no parent".into()))?
            .to_path_buf();
        // test harnesses run from target/<profile>/deps
        if dir.ends_with("deps") && !dir.join(WORKER_BINARY).exists() {
            if let Some(parent) = dir.parent() {
                dir = parent.to_path_buf();
            }
        }
        Ok(dir.join(WORKER_BINARY))
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `MPIPOOL_KEY` overrides `key`.
    /// Examples:
    /// - `MPIPOOL_MAX_WORKERS` -> `max_workers`
    /// - `MPIPOOL_BACKEND` -> `backend`
    /// - `MPIPOOL_WORKER_PROGRAM` -> `worker_program`
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    pub(crate) fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parse_usize = |key: &str| lookup(key).and_then(|v| v.parse::<usize>().ok());

        if let Some(v) = parse_usize("MPIPOOL_MAX_WORKERS") {
            self.max_workers = v;
        }
        if let Some(v) = parse_usize("MPIPOOL_CORES_PER_WORKER") {
            self.cores_per_worker = v;
        }
        if let Some(v) = parse_usize("MPIPOOL_THREADS_PER_CORE") {
            self.threads_per_core = v;
        }
        if let Some(v) = parse_usize("MPIPOOL_GPUS_PER_WORKER") {
            self.gpus_per_worker = v;
        }
        if let Some(v) = lookup("MPIPOOL_BACKEND") {
            match v.parse() {
                Ok(backend) => self.backend = backend,
                Err(e) => tracing::warn!(error = %e, "ignoring MPIPOOL_BACKEND"),
            }
        }
        if let Some(v) = lookup("MPIPOOL_WORKING_DIRECTORY").filter(|v| !v.is_empty()) {
            self.working_directory = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("MPIPOOL_WORKER_PROGRAM").filter(|v| !v.is_empty()) {
            self.worker_program = Some(PathBuf::from(v));
        }
    }
}
