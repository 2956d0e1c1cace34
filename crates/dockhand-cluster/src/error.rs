//! Cluster error types.

use thiserror::Error;

/// Result type alias for membership operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Membership transport failures.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("invalid advertise address: {0}")]
    InvalidAddress(String),

    #[error("unable to join cluster via {addr}: {reason}")]
    Join { addr: String, reason: String },

    #[error("unable to read peers file {path}: {reason}")]
    Peers { path: String, reason: String },

    #[error("cluster already created")]
    AlreadyCreated,
}
