//! Error types for the try job integrator.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Network or RPC failure talking to a remote service.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote service answered with an error message.
    #[error("remote error: {0}")]
    Remote(String),

    /// A permanent error cached alongside a task configuration.
    #[error("cached task config error: {0}")]
    CachedConfig(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
