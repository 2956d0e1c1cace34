//! Agent options, resolved once at startup and never mutated afterwards.

use std::path::PathBuf;
use std::time::Duration;

use crate::edge_key::EdgeKey;
use crate::error::{ConfigError, ConfigResult};
use crate::types::{AgentTags, NodeRole};

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0";
pub const DEFAULT_AGENT_PORT: u16 = 9001;
pub const DEFAULT_ENGINE_ENDPOINT: &str = "unix:///var/run/docker.sock";
pub const DEFAULT_ENGINE_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_EDGE_SERVER_ADDR: &str = "0.0.0.0";
pub const DEFAULT_EDGE_SERVER_PORT: u16 = 80;
pub const DEFAULT_EDGE_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_EDGE_SLEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Immutable agent configuration.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub listen_address: String,
    pub listen_port: u16,
    /// Address other members use to reach this agent.
    pub cluster_advertise_address: Option<String>,
    /// Existing member to join, `host:port`.
    pub cluster_join_address: Option<String>,
    /// TOML file listing the other members.
    pub cluster_peers_file: Option<PathBuf>,
    pub node_name: String,
    pub node_role: NodeRole,
    pub host_management_enabled: bool,
    pub shared_secret: Option<String>,
    /// `unix:///path` or `tcp://host:port`.
    pub engine_endpoint: String,
    pub engine_client_timeout: Duration,
    pub edge: Option<EdgeOptions>,
}

impl AgentOptions {
    /// Options for a single standalone node with no cluster and no edge mode.
    pub fn standalone(node_name: impl Into<String>) -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDR.to_string(),
            listen_port: DEFAULT_AGENT_PORT,
            cluster_advertise_address: None,
            cluster_join_address: None,
            cluster_peers_file: None,
            node_name: node_name.into(),
            node_role: NodeRole::Manager,
            host_management_enabled: false,
            shared_secret: None,
            engine_endpoint: DEFAULT_ENGINE_ENDPOINT.to_string(),
            engine_client_timeout: DEFAULT_ENGINE_CLIENT_TIMEOUT,
            edge: None,
        }
    }

    /// Whether the agent participates in a multi-node cluster.
    pub fn cluster_enabled(&self) -> bool {
        self.cluster_join_address.is_some() || self.cluster_peers_file.is_some()
    }

    /// Address advertised to other members.
    ///
    /// Falls back to the listen address, or loopback when listening on
    /// the wildcard address.
    pub fn advertise_address(&self) -> String {
        match &self.cluster_advertise_address {
            Some(addr) => addr.clone(),
            None if self.listen_address == "0.0.0.0" => "127.0.0.1".to_string(),
            None => self.listen_address.clone(),
        }
    }

    /// Port the HTTP server binds to; edge mode uses its own server port.
    pub fn server_port(&self) -> u16 {
        match &self.edge {
            Some(edge) => edge.server_port,
            None => self.listen_port,
        }
    }

    /// Host the HTTP server binds to.
    pub fn server_address(&self) -> &str {
        match &self.edge {
            Some(edge) => &edge.server_address,
            None => &self.listen_address,
        }
    }

    pub fn tags(&self) -> AgentTags {
        AgentTags {
            node_name: self.node_name.clone(),
            node_role: self.node_role,
            agent_port: self.listen_port,
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.node_name.trim().is_empty() {
            return Err(ConfigError::Missing("node name"));
        }
        if self.listen_port == 0 {
            return Err(ConfigError::InvalidPort {
                option: "AGENT_PORT",
                value: "0".to_string(),
            });
        }
        if self.engine_client_timeout.is_zero() {
            return Err(ConfigError::InvalidDuration(
                "engine client timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Edge mode settings.
#[derive(Debug, Clone)]
pub struct EdgeOptions {
    pub edge_id: String,
    pub key: EdgeKey,
    pub server_address: String,
    pub server_port: u16,
    pub poll_interval: Duration,
    pub sleep_interval: Duration,
}

impl EdgeOptions {
    /// Resolve edge options; both the identifier and the key are mandatory.
    pub fn resolve(
        edge_id: Option<&str>,
        edge_key: Option<&str>,
        server_address: &str,
        server_port: u16,
        poll_interval: Duration,
        sleep_interval: Duration,
    ) -> ConfigResult<Self> {
        let edge_id = edge_id
            .filter(|id| !id.trim().is_empty())
            .ok_or(ConfigError::Missing("EDGE_ID"))?;
        let key = edge_key
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::Missing("EDGE_KEY"))?;
        if poll_interval.is_zero() || sleep_interval.is_zero() {
            return Err(ConfigError::InvalidDuration(
                "edge intervals must be positive".to_string(),
            ));
        }

        Ok(Self {
            edge_id: edge_id.to_string(),
            key: EdgeKey::decode(key)?,
            server_address: server_address.to_string(),
            server_port,
            poll_interval,
            sleep_interval,
        })
    }

    /// Address the reverse tunnel dials for inbound streams.
    pub fn local_api_address(&self) -> String {
        let host = if self.server_address == "0.0.0.0" {
            "127.0.0.1"
        } else {
            self.server_address.as_str()
        };
        format!("{host}:{}", self.server_port)
    }
}

/// Parse a duration such as `500ms`, `5s`, `5m` or `1h`.
pub fn parse_duration(s: &str) -> ConfigResult<Duration> {
    let s = s.trim();
    let invalid = || ConfigError::InvalidDuration(s.to_string());

    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => return Err(invalid()),
    };
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => value.checked_mul(60).map(Duration::from_secs).ok_or_else(invalid),
        "h" => value.checked_mul(3600).map(Duration::from_secs).ok_or_else(invalid),
        _ => Err(invalid()),
    }
}
