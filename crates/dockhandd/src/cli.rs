//! Command line and environment parsing.

use std::path::PathBuf;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, ValueEnum};

use dockhand_core::config::{
    DEFAULT_AGENT_PORT, DEFAULT_EDGE_SERVER_ADDR, DEFAULT_EDGE_SERVER_PORT, DEFAULT_ENGINE_ENDPOINT,
    DEFAULT_LISTEN_ADDR,
};
use dockhand_core::{AgentOptions, ConfigResult, EdgeOptions, NodeRole, parse_duration};

#[derive(Debug, Parser)]
#[command(name = "dockhandd", version, about = "Dockhand container host agent")]
pub struct Cli {
    /// Address the agent API listens on.
    #[arg(long, env = "AGENT_HOST", default_value = DEFAULT_LISTEN_ADDR)]
    pub host: String,

    #[arg(long, env = "AGENT_PORT", default_value_t = DEFAULT_AGENT_PORT)]
    pub port: u16,

    /// Address advertised to other cluster members.
    #[arg(long, env = "AGENT_ADVERTISE_ADDR")]
    pub advertise_addr: Option<String>,

    /// Existing member to join, `host:port`.
    #[arg(long, env = "AGENT_CLUSTER_ADDR")]
    pub cluster_addr: Option<String>,

    /// TOML file listing the other members.
    #[arg(long, env = "AGENT_CLUSTER_PEERS")]
    pub cluster_peers: Option<PathBuf>,

    /// Defaults to `$HOSTNAME`, then `localhost`.
    #[arg(long, env = "AGENT_NODE_NAME")]
    pub node_name: Option<String>,

    #[arg(long, env = "AGENT_NODE_ROLE", default_value = "manager")]
    pub node_role: NodeRole,

    /// Shared secret; without it the first signing key is trusted.
    #[arg(long, env = "AGENT_SECRET", hide_env_values = true)]
    pub secret: Option<String>,

    #[arg(
        long,
        env = "CAP_HOST_MANAGEMENT",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub host_management: bool,

    /// Container engine endpoint.
    #[arg(long, env = "DOCKER_HOST", default_value = DEFAULT_ENGINE_ENDPOINT)]
    pub docker_host: String,

    /// Engine response timeout, in seconds.
    #[arg(long, env = "DOCKER_CLIENT_TIMEOUT", default_value_t = 10)]
    pub docker_client_timeout: u64,

    #[arg(
        long,
        env = "EDGE",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub edge: bool,

    #[arg(long, env = "EDGE_ID")]
    pub edge_id: Option<String>,

    #[arg(long, env = "EDGE_KEY", hide_env_values = true)]
    pub edge_key: Option<String>,

    #[arg(long, env = "EDGE_SERVER_HOST", default_value = DEFAULT_EDGE_SERVER_ADDR)]
    pub edge_server_host: String,

    #[arg(long, env = "EDGE_SERVER_PORT", default_value_t = DEFAULT_EDGE_SERVER_PORT)]
    pub edge_server_port: u16,

    #[arg(long, env = "EDGE_POLL_INTERVAL", default_value = "5s", value_parser = parse_duration)]
    pub edge_poll_interval: Duration,

    #[arg(long, env = "EDGE_SLEEP_INTERVAL", default_value = "5m", value_parser = parse_duration)]
    pub edge_sleep_interval: Duration,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl Cli {
    /// Resolve and validate the agent options.
    pub fn options(&self) -> ConfigResult<AgentOptions> {
        let edge = if self.edge {
            Some(EdgeOptions::resolve(
                self.edge_id.as_deref(),
                self.edge_key.as_deref(),
                &self.edge_server_host,
                self.edge_server_port,
                self.edge_poll_interval,
                self.edge_sleep_interval,
            )?)
        } else {
            None
        };

        let node_name = self
            .node_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "localhost".to_string());

        let options = AgentOptions {
            listen_address: self.host.clone(),
            listen_port: self.port,
            cluster_advertise_address: self.advertise_addr.clone(),
            cluster_join_address: self.cluster_addr.clone(),
            cluster_peers_file: self.cluster_peers.clone(),
            node_name,
            node_role: self.node_role,
            host_management_enabled: self.host_management,
            shared_secret: self.secret.clone(),
            engine_endpoint: self.docker_host.clone(),
            engine_client_timeout: Duration::from_secs(self.docker_client_timeout),
            edge,
        };
        options.validate()?;
        Ok(options)
    }

    /// Filter directives used when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> String {
        let level = self.log_level.trim().to_ascii_lowercase();
        format!("{level},dockhand={level},dockhandd={level}")
    }
}

#[cfg(test)]
mod tests {
    use dockhand_core::EdgeKey;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["dockhandd", "--node-name", "node-1"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    fn edge_key() -> String {
        EdgeKey {
            controller_url: "https://controller.example".to_string(),
            endpoint_id: "7".to_string(),
            tunnel_server_address: "tunnel.example:8000".to_string(),
            tunnel_server_fingerprint: "ab:cd".to_string(),
            tunnel_credentials: "user:pass".to_string(),
        }
        .encode()
    }

    #[test]
    fn standalone_options_from_flags() {
        let cli = parse(&["--port", "9101", "--node-role", "worker", "--secret", "s"]);
        let options = cli.options().unwrap();

        assert_eq!(options.node_name, "node-1");
        assert_eq!(options.listen_port, 9101);
        assert_eq!(options.node_role, NodeRole::Worker);
        assert_eq!(options.shared_secret.as_deref(), Some("s"));
        assert!(!options.cluster_enabled());
        assert!(options.edge.is_none());
    }

    #[test]
    fn cluster_flags_enable_membership() {
        let options = parse(&["--cluster-addr", "10.0.0.2:9001", "--advertise-addr", "10.0.0.1"])
            .options()
            .unwrap();
        assert!(options.cluster_enabled());
        assert_eq!(options.advertise_address(), "10.0.0.1");
    }

    #[test]
    fn boolish_flags_accept_several_spellings() {
        assert!(parse(&["--host-management"]).host_management);
        assert!(parse(&["--host-management", "yes"]).host_management);
        assert!(!parse(&["--host-management", "0"]).host_management);
    }

    #[test]
    fn invalid_role_is_rejected() {
        let result = Cli::try_parse_from(["dockhandd", "--node-role", "leader"]);
        assert!(result.is_err());
    }

    #[test]
    fn edge_mode_requires_id_and_key() {
        let err = parse(&["--edge", "--edge-key", &edge_key()]).options().unwrap_err();
        assert!(err.to_string().contains("EDGE_ID"), "{err}");

        let err = parse(&["--edge", "--edge-id", "e1"]).options().unwrap_err();
        assert!(err.to_string().contains("EDGE_KEY"), "{err}");
    }

    #[test]
    fn edge_options_are_resolved() {
        let key = edge_key();
        let options = parse(&[
            "--edge",
            "true",
            "--edge-id",
            "e1",
            "--edge-key",
            &key,
            "--edge-server-port",
            "9443",
            "--edge-poll-interval",
            "30s",
            "--edge-sleep-interval",
            "1m",
        ])
        .options()
        .unwrap();

        let edge = options.edge.unwrap();
        assert_eq!(edge.edge_id, "e1");
        assert_eq!(edge.key.endpoint_id, "7");
        assert_eq!(edge.poll_interval, Duration::from_secs(30));
        assert_eq!(edge.sleep_interval, Duration::from_secs(60));
        assert_eq!(edge.local_api_address(), "127.0.0.1:9443");
    }

    #[test]
    fn bad_durations_fail_to_parse() {
        let result = Cli::try_parse_from(["dockhandd", "--edge-poll-interval", "soon"]);
        assert!(result.is_err());
    }

    #[test]
    fn log_filter_covers_agent_targets() {
        let cli = parse(&["--log-level", "DEBUG"]);
        assert_eq!(cli.log_filter(), "debug,dockhand=debug,dockhandd=debug");
        assert_eq!(cli.log_format, LogFormat::Text);
        assert_eq!(parse(&["--log-format", "json"]).log_format, LogFormat::Json);
    }
}
