//! Shared types used across Dockhand crates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Version of the agent, reported on every response.
pub const AGENT_VERSION: &str = "1.2.1";
/// Version of the agent HTTP API, reported on every response.
pub const API_VERSION: &str = "2";

/// Request header naming the node a call must be served by.
pub const HEADER_TARGET: &str = "x-dockhand-target";
/// Request header forcing a call onto a manager node.
pub const HEADER_MANAGER_OPERATION: &str = "x-dockhand-manageroperation";
/// Request header carrying the base64 DER signature.
pub const HEADER_SIGNATURE: &str = "x-dockhand-signature";
/// Request header carrying the hex encoded public key.
pub const HEADER_PUBLIC_KEY: &str = "x-dockhand-publickey";
/// Request header carrying the edge identifier on status polls.
pub const HEADER_EDGE_ID: &str = "x-dockhand-edgeid";
/// Response header listing nodes that failed during aggregation.
pub const HEADER_UNREACHABLE_NODES: &str = "x-dockhand-unreachable-nodes";

/// Response header carrying [`AGENT_VERSION`].
pub const RESPONSE_AGENT_HEADER: &str = "dockhand-agent";
/// Response header carrying [`API_VERSION`].
pub const RESPONSE_API_VERSION_HEADER: &str = "dockhand-agent-api-version";

/// Message signed by the controller and verified by the trust gate.
pub const SIGNATURE_MESSAGE: &str = "Dockhand-App";

/// JSON key used to annotate aggregated objects.
pub const RESPONSE_METADATA_KEY: &str = "Dockhand";

/// Role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Manager,
    Worker,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Manager => "manager",
            NodeRole::Worker => "worker",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manager" => Ok(NodeRole::Manager),
            "worker" => Ok(NodeRole::Worker),
            other => Err(ConfigError::InvalidRole(other.to_string())),
        }
    }
}

/// One running agent instance as seen by the membership provider.
///
/// `(address, port)` identifies a member; `node_name` is expected to be
/// unique within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub address: String,
    pub port: u16,
    pub node_name: String,
    pub node_role: NodeRole,
}

impl ClusterMember {
    /// `address:port` of the member's agent API.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Whether two entries describe the same member.
    pub fn same_identity(&self, other: &ClusterMember) -> bool {
        self.address == other.address && self.port == other.port
    }
}

/// Tags attached to this node when it joins a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentTags {
    pub node_name: String,
    pub node_role: NodeRole,
    pub agent_port: u16,
}

impl AgentTags {
    pub fn is_manager(&self) -> bool {
        self.node_role == NodeRole::Manager
    }
}

/// Parameters for one reverse tunnel, derived from the edge key and a
/// controller directive. Discarded once the tunnel closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub server_address: String,
    pub server_fingerprint: String,
    pub credentials: String,
    pub remote_port: u16,
    pub local_address: String,
}

/// Directive returned by the controller's status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PollStatus {
    Idle,
    Required,
}

/// A scheduled job descriptor handed out by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "CronExpression")]
    pub cron_expression: String,
    /// Base64 encoded script body.
    #[serde(rename = "Script", default)]
    pub script: String,
    #[serde(rename = "Version", default)]
    pub version: i64,
}

/// Body of a successful status poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollStatusResponse {
    pub status: PollStatus,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub schedules: Vec<Schedule>,
    /// Requested check-in interval, in seconds.
    #[serde(rename = "checkin", default)]
    pub checkin_interval_seconds: f64,
}
