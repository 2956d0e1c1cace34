//! Agent lifecycle: wiring, serving, and orderly shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dockhand_api::{ApiState, EcdsaVerifier, build_router};
use dockhand_cluster::{ClusterService, StaticMembership};
use dockhand_core::{AGENT_VERSION, AgentOptions};
use dockhand_edge::ScheduleRegistry;
use dockhand_proxy::{AgentRouter, Upstream};

use crate::edge;

/// Bound on leaving the cluster and closing the tunnel.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the agent until a shutdown signal arrives.
pub async fn run(options: AgentOptions) -> anyhow::Result<()> {
    info!(
        version = AGENT_VERSION,
        node = %options.node_name,
        role = %options.node_role,
        edge = options.edge.is_some(),
        host_management = options.host_management_enabled,
        "dockhand agent starting"
    );

    let shutdown = CancellationToken::new();

    let engine = Upstream::parse(&options.engine_endpoint).context("invalid engine endpoint")?;
    let mut router = AgentRouter::new(options.tags(), engine).with_engine_timeout(options.engine_client_timeout);

    let cluster = if options.cluster_enabled() {
        let membership = Arc::new(StaticMembership::new(options.cluster_peers_file.clone()));
        membership
            .create(
                &options.advertise_address(),
                options.cluster_join_address.as_deref(),
                &options.tags(),
            )
            .await
            .context("unable to create cluster")?;
        router = router.with_cluster(Arc::clone(&membership) as Arc<dyn ClusterService>);
        Some(membership)
    } else {
        info!("no cluster configured, running standalone");
        None
    };

    let verifier = EcdsaVerifier::new(options.shared_secret.as_deref()).context("invalid shared secret")?;
    if options.shared_secret.is_none() {
        info!("no shared secret, the first signing key will be trusted");
    }
    let schedules = Arc::new(ScheduleRegistry::new());

    let edge = match &options.edge {
        Some(edge_options) => Some(edge::start(edge_options, schedules.clone(), shutdown.clone())?),
        None => None,
    };

    let app = build_router(ApiState::new(router, Arc::new(verifier), schedules));
    let addr = format!("{}:{}", options.server_address(), options.server_port());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("unable to bind {addr}"))?;
    info!(%addr, "API server listening");

    let signal = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => signal.cancel(),
                _ = signal.cancelled() => {}
            }
        })
        .await;
    shutdown.cancel();

    let teardown = async {
        if let Some(edge) = edge {
            edge.stop().await;
        }
        if let Some(cluster) = cluster {
            cluster.leave().await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, teardown).await.is_err() {
        warn!(timeout = ?SHUTDOWN_TIMEOUT, "shutdown did not complete in time");
    }

    served.context("API server failed")?;
    info!("dockhand agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
