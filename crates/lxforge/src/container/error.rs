//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container tool invocation failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    NotFound(String),

    /// The container was never created (insufficient privilege at
    /// construction time); every operation needing a live container fails
    /// with this until one exists.
    #[error("no container: construction ran without root privilege")]
    NotCreated,

    /// The readiness poll exhausted its deadline.
    #[error("container not ready after {attempts} attempts over {waited:?}")]
    Timeout {
        waited: std::time::Duration,
        attempts: u32,
    },

    /// The LXC userspace tools are not installed or not on PATH.
    #[error("no container runtime available (lxc userspace tools not found)")]
    NoRuntimeAvailable,

    /// Failed to parse tool output.
    #[error("failed to parse container tool output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
