//! Cluster membership for Dockhand agents.
//!
//! The request router only ever talks to the [`ClusterService`]
//! capability; the transport that discovers members is pluggable.
//!
//! # Architecture
//!
//! ```text
//! ClusterService (trait)
//!   ├── create()  → bootstrap or join, tag this node
//!   ├── members() → consistent point-in-time snapshot
//!   ├── leave()   → best-effort deregistration
//!   └── member_by_role() / member_by_node_name() → linear scans
//!
//! StaticMembership
//!   ├── Peers loaded from a TOML file
//!   ├── Background refresh swaps the whole snapshot atomically
//!   └── Join address checked once at create()
//! ```

pub mod error;
pub mod membership;
pub mod service;

pub use error::{ClusterError, ClusterResult};
pub use membership::{PeersFile, StaticMembership};
pub use service::ClusterService;
