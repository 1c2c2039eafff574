//! KDL configuration parsing for the try job integrator.
//!
//! This crate handles parsing of:
//! - The integrator configuration (bucket, endpoints, intervals, batch sizes)
//! - Human-readable durations (`30s`, `15m`, `3h`)

pub mod error;
pub mod integrator;

pub use error::{ConfigError, ConfigResult};
pub use integrator::{IntegratorConfig, SkipRepoState, parse_config, parse_duration};
