//! Per-request routing across the cluster.
//!
//! Every inbound engine call is classified once from its headers and
//! path, resolved against the current membership snapshot, then served
//! by the local engine, a single peer, or every member at once.
//!
//! # Components
//!
//! - **`classify`**: header and path driven [`RequestClass`]
//! - **`router`**: [`AgentRouter`], resolution and dispatch
//! - **`client`**: HTTP/1 client over TCP or a unix socket
//! - **`aggregate`**: merges per-node bodies into one response

pub mod aggregate;
pub mod classify;
pub mod client;
pub mod error;
pub mod router;

pub use aggregate::{Aggregation, MemberFailure, NodeContribution};
pub use classify::{RequestClass, classify, strip_version_prefix};
pub use client::Upstream;
pub use error::{AggregationError, EngineError, GatewayError, ProxyError, RoutingError};
pub use router::{AgentRouter, DEFAULT_ENGINE_TIMEOUT, DEFAULT_PEER_TIMEOUT, Route};
