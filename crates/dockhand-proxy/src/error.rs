//! Router error types.

use thiserror::Error;

use crate::aggregate::MemberFailure;

/// The requested target could not be resolved. Never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("target node not found: {0}")]
    UnknownNode(String),

    #[error("no manager node available")]
    NoManager,
}

/// A forwarding hop to a peer agent failed.
#[derive(Debug, Error)]
#[error("forwarding to node {node} failed: {reason}")]
pub struct GatewayError {
    pub node: String,
    pub reason: String,
}

/// Every member failed a cluster-wide query.
#[derive(Debug, Error)]
#[error("all {attempted} cluster members failed to answer")]
pub struct AggregationError {
    pub attempted: usize,
    pub failures: Vec<MemberFailure>,
}

/// The local engine could not be reached or answered badly.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("unable to reach engine: {0}")]
    Unreachable(String),

    #[error("engine request timed out")]
    Timeout,
}

/// Low-level client failures, before they are attributed to a target.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect: {0}")]
    Connect(#[source] std::io::Error),

    #[error("handshake: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("request: {0}")]
    Request(#[source] hyper::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Anything the router can fail with.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}
