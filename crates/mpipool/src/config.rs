//! Pool configuration: the immutable resource specification.
//!
//! Loaded from TOML with `MPIPOOL_*` environment overrides, or built in code
//! with [`PoolConfig::new`]. See [`PoolConfig::validate`] for the rules each
//! backend enforces.

mod loading;
mod types;
mod validation;


pub use types::{BackendKind, PoolConfig};
