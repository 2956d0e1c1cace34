//! Configuration error types.

use thiserror::Error;

/// Result type alias for option resolution.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while resolving agent options at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing mandatory option: {0}")]
    Missing(&'static str),

    #[error("invalid port format in {option}: {value}")]
    InvalidPort { option: &'static str, value: String },

    #[error("invalid time duration format: {0}")]
    InvalidDuration(String),

    #[error("invalid node role: {0}")]
    InvalidRole(String),

    #[error("invalid edge key: {0}")]
    InvalidEdgeKey(String),
}
