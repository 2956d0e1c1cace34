//! dockhandd: the Dockhand agent daemon.
//!
//! Serves the container engine API of this host, routes requests across
//! the cluster when membership is configured, and in edge mode polls the
//! controller to drive a reverse tunnel.
//!
//! # Usage
//!
//! ```text
//! AGENT_SECRET=s3cret dockhandd --cluster-peers /etc/dockhand/peers.toml
//! EDGE=1 EDGE_ID=... EDGE_KEY=... dockhandd
//! ```

mod agent;
mod cli;
mod edge;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(cli.log_filter()))
        .context("invalid log level")?;
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }

    let options = cli.options().context("invalid configuration")?;
    agent::run(options).await
}
