//! Edge mode wiring: tunnel controller, idle watchdog and poll loop.

use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dockhand_core::EdgeOptions;
use dockhand_edge::{
    DEFAULT_POLL_TIMEOUT, EdgeOperator, HttpStatusClient, ReverseTunnelTransport, ScheduleManager,
    StatusSource, TunnelController, TunnelTransport,
};

/// Background tasks of a running edge agent.
pub struct EdgeRuntime {
    controller: Arc<TunnelController>,
    poll: JoinHandle<()>,
    watchdog: JoinHandle<()>,
}

/// Start polling the controller. Both tasks stop once `shutdown` fires.
pub fn start(
    options: &EdgeOptions,
    schedules: Arc<dyn ScheduleManager>,
    shutdown: CancellationToken,
) -> anyhow::Result<EdgeRuntime> {
    let source: Arc<dyn StatusSource> = Arc::new(
        HttpStatusClient::new(&options.key, &options.edge_id, DEFAULT_POLL_TIMEOUT)
            .context("unable to build controller client")?,
    );
    let transport: Arc<dyn TunnelTransport> = Arc::new(ReverseTunnelTransport::new());
    start_with(options, source, transport, schedules, shutdown)
}

fn start_with(
    options: &EdgeOptions,
    source: Arc<dyn StatusSource>,
    transport: Arc<dyn TunnelTransport>,
    schedules: Arc<dyn ScheduleManager>,
    shutdown: CancellationToken,
) -> anyhow::Result<EdgeRuntime> {
    let controller = Arc::new(TunnelController::new(transport, options.sleep_interval));
    let watchdog = controller.spawn_watchdog(shutdown.clone());

    let operator = EdgeOperator::new(
        source,
        Arc::clone(&controller),
        schedules,
        options.key.clone(),
        options.local_api_address(),
        options.poll_interval,
    );

    info!(
        edge_id = %options.edge_id,
        controller = %options.key.controller_url,
        tunnel_server = %options.key.tunnel_server_address,
        poll_interval = ?options.poll_interval,
        sleep_interval = ?options.sleep_interval,
        "edge mode enabled"
    );
    let poll = tokio::spawn(async move { operator.run(shutdown).await });

    Ok(EdgeRuntime {
        controller,
        poll,
        watchdog,
    })
}

impl EdgeRuntime {
    /// Wait for the background tasks, then close any open tunnel.
    /// The shutdown token must already be cancelled.
    pub async fn stop(self) {
        for (task, handle) in [("poll", self.poll), ("watchdog", self.watchdog)] {
            if let Err(e) = handle.await {
                warn!(task, error = %e, "edge task ended abnormally");
            }
        }
        if let Err(e) = self.controller.close_tunnel().await {
            warn!(error = %e, "unable to close tunnel on shutdown");
        }
    }
}
