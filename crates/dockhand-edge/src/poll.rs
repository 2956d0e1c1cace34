//! Controller polling.
//!
//! One task runs the loop: wait, poll, apply the directive, repeat. The
//! interval lives in a `watch` channel so a change, whether it comes from
//! a poll response or from outside, abandons the wait in progress and
//! starts a new one with the new cadence. Because the same task both
//! waits and polls, two cycles can never overlap.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dockhand_core::{EdgeKey, HEADER_EDGE_ID, PollStatus, PollStatusResponse, TunnelConfig};

use crate::error::PollError;
use crate::schedule::ScheduleManager;
use crate::tunnel::TunnelController;

/// Upper bound on one status request.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetches the controller's directive for this endpoint.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self) -> Result<PollStatusResponse, PollError>;
}

/// Polls `GET <controller>/api/endpoints/<id>/status` over HTTP.
pub struct HttpStatusClient {
    client: reqwest::Client,
    url: String,
    edge_id: String,
}

impl HttpStatusClient {
    pub fn new(key: &EdgeKey, edge_id: &str, timeout: Duration) -> Result<Self, PollError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PollError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: key.status_url(),
            edge_id: edge_id.to_string(),
        })
    }
}

#[async_trait]
impl StatusSource for HttpStatusClient {
    async fn fetch_status(&self) -> Result<PollStatusResponse, PollError> {
        let response = self
            .client
            .get(&self.url)
            .header(HEADER_EDGE_ID, &self.edge_id)
            .send()
            .await
            .map_err(|e| PollError::Transport(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(PollError::Status(status.as_u16()));
        }

        response
            .json::<PollStatusResponse>()
            .await
            .map_err(|e| PollError::Decode(e.to_string()))
    }
}

/// Convert a requested check-in interval. Non-positive or non-finite
/// values are ignored.
fn checkin_interval(seconds: f64) -> Option<Duration> {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::try_from_secs_f64(seconds).ok()
    } else {
        None
    }
}

/// Drives the tunnel and the schedule set from controller directives.
pub struct EdgeOperator {
    source: Arc<dyn StatusSource>,
    tunnel: Arc<TunnelController>,
    schedules: Arc<dyn ScheduleManager>,
    key: EdgeKey,
    local_address: String,
    interval_tx: watch::Sender<Duration>,
}

impl EdgeOperator {
    /// `local_address` is the agent API the tunnel forwards to.
    pub fn new(
        source: Arc<dyn StatusSource>,
        tunnel: Arc<TunnelController>,
        schedules: Arc<dyn ScheduleManager>,
        key: EdgeKey,
        local_address: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        let (interval_tx, _) = watch::channel(poll_interval);
        Self {
            source,
            tunnel,
            schedules,
            key,
            local_address: local_address.into(),
            interval_tx,
        }
    }

    pub fn interval(&self) -> Duration {
        *self.interval_tx.borrow()
    }

    pub fn tunnel(&self) -> &Arc<TunnelController> {
        &self.tunnel
    }

    /// Change the poll cadence. A running loop abandons its current wait.
    ///
    /// Returns whether the interval changed; zero is rejected.
    pub fn set_interval(&self, interval: Duration) -> bool {
        if interval.is_zero() {
            return false;
        }
        self.interval_tx.send_if_modified(|current| {
            if *current == interval {
                false
            } else {
                *current = interval;
                true
            }
        })
    }

    fn tunnel_config(&self, remote_port: u16) -> TunnelConfig {
        TunnelConfig {
            server_address: self.key.tunnel_server_address.clone(),
            server_fingerprint: self.key.tunnel_server_fingerprint.clone(),
            credentials: self.key.tunnel_credentials.clone(),
            remote_port,
            local_address: self.local_address.clone(),
        }
    }

    /// Run one poll cycle.
    ///
    /// A failed request changes nothing. Otherwise the tunnel directive,
    /// the schedule list and the check-in interval are applied in that
    /// order; failures in the first two are logged and do not stop the
    /// cycle.
    pub async fn poll_once(&self) -> Result<(), PollError> {
        let response = self.source.fetch_status().await.inspect_err(|e| {
            warn!(error = %e, "status poll failed, skipping cycle");
        })?;

        debug!(
            status = ?response.status,
            port = response.port,
            schedule_count = response.schedules.len(),
            checkin = response.checkin_interval_seconds,
            "status received"
        );

        match response.status {
            PollStatus::Idle if self.tunnel.is_open() => {
                info!("controller is idle, closing tunnel");
                if let Err(e) = self.tunnel.close_tunnel().await {
                    warn!(error = %e, "failed to close tunnel");
                }
            }
            PollStatus::Required if !self.tunnel.is_open() => {
                info!(remote_port = response.port, "controller requires a tunnel, opening");
                if let Err(e) = self.tunnel.create_tunnel(self.tunnel_config(response.port)).await {
                    error!(error = %e, remote_port = response.port, "failed to open tunnel");
                }
            }
            _ => {}
        }

        if let Err(e) = self.schedules.apply(&response.schedules).await {
            warn!(error = %e, "failed to apply schedules");
        }

        if let Some(interval) = checkin_interval(response.checkin_interval_seconds) {
            if self.set_interval(interval) {
                info!(interval = ?interval, "poll interval updated");
            }
        }

        Ok(())
    }

    /// Poll until `shutdown` fires. The first poll happens immediately.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval_rx = self.interval_tx.subscribe();
        info!(interval = ?*interval_rx.borrow(), "edge poll loop started");

        let mut wait = Duration::ZERO;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = interval_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    wait = *interval_rx.borrow_and_update();
                    debug!(interval = ?wait, "poll interval changed, restarting wait");
                    continue;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.poll_once() => {}
            }

            wait = *interval_rx.borrow_and_update();
        }

        info!("edge poll loop stopped");
    }
}
