//! Types shared by every Dockhand crate.
//!
//! Holds the cluster member model, the immutable agent options resolved
//! at startup, the edge key decoded from the bootstrap token, and the
//! wire entities exchanged with the remote controller.

pub mod config;
pub mod edge_key;
pub mod error;
pub mod types;

pub use config::{AgentOptions, EdgeOptions, parse_duration};
pub use edge_key::EdgeKey;
pub use error::{ConfigError, ConfigResult};
pub use types::*;
