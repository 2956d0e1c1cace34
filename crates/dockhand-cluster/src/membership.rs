//! Static membership provider.
//!
//! Topology comes from a TOML peers file that is re-read on an interval.
//! Every refresh builds a complete member list and swaps it in with a
//! single write, so readers always see a whole snapshot.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dockhand_core::{AgentTags, ClusterMember};

use crate::error::{ClusterError, ClusterResult};
use crate::service::ClusterService;

/// How often the peers file is re-read.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound on probing the join address.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// On-disk peers list.
///
/// ```toml
/// [[members]]
/// address = "10.0.0.2"
/// port = 9001
/// node_name = "node-2"
/// node_role = "worker"
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct PeersFile {
    #[serde(default)]
    pub members: Vec<ClusterMember>,
}

impl PeersFile {
    pub fn load(path: &Path) -> ClusterResult<Self> {
        let peers_err = |reason: String| ClusterError::Peers {
            path: path.display().to_string(),
            reason,
        };
        let content = std::fs::read_to_string(path).map_err(|e| peers_err(e.to_string()))?;
        toml::from_str(&content).map_err(|e| peers_err(e.to_string()))
    }
}

struct Shared {
    snapshot: RwLock<Arc<Vec<ClusterMember>>>,
    local: RwLock<Option<ClusterMember>>,
}

impl Shared {
    fn local(&self) -> Option<ClusterMember> {
        self.local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn snapshot(&self) -> Arc<Vec<ClusterMember>> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Merge `peers` with the local member and publish the result.
    /// Returns whether the published list differs from the previous one.
    fn publish(&self, peers: Vec<ClusterMember>) -> bool {
        let mut merged: Vec<ClusterMember> = Vec::with_capacity(peers.len() + 1);
        if let Some(local) = self.local() {
            merged.push(local);
        }
        for peer in peers {
            if !merged.iter().any(|m| m.same_identity(&peer)) {
                merged.push(peer);
            }
        }

        let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        let changed = **guard != merged;
        *guard = Arc::new(merged);
        changed
    }
}

struct RefreshTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Membership provider backed by a static peers list.
pub struct StaticMembership {
    shared: Arc<Shared>,
    peers_file: Option<PathBuf>,
    refresh_interval: Duration,
    refresh: Mutex<Option<RefreshTask>>,
}

impl StaticMembership {
    /// Create a provider; `peers_file` may be `None` for a cluster whose
    /// peers are pushed through [`StaticMembership::update`].
    pub fn new(peers_file: Option<PathBuf>) -> Self {
        Self {
            shared: Arc::new(Shared {
                snapshot: RwLock::new(Arc::new(Vec::new())),
                local: RwLock::new(None),
            }),
            peers_file,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            refresh: Mutex::new(None),
        }
    }

    /// Set how often the peers file is re-read.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Replace the set of peers. The local member is always kept.
    pub fn update(&self, peers: Vec<ClusterMember>) {
        if self.shared.publish(peers) {
            info!(
                members = self.shared.snapshot().len(),
                "cluster membership updated"
            );
        }
    }

    fn spawn_refresh(&self, path: PathBuf) {
        let cancel = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let interval = self.refresh_interval;
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            debug!(path = %path.display(), ?interval, "peers refresh loop started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        match PeersFile::load(&path) {
                            Ok(file) => {
                                if shared.publish(file.members) {
                                    info!(members = shared.snapshot().len(), "cluster membership refreshed");
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "peers refresh failed, keeping previous snapshot");
                            }
                        }
                    }
                    _ = token.cancelled() => {
                        debug!("peers refresh loop shutting down");
                        break;
                    }
                }
            }
        });

        let mut slot = self.refresh.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = slot.replace(RefreshTask { cancel, handle }) {
            old.cancel.cancel();
            old.handle.abort();
        }
    }
}

#[async_trait]
impl ClusterService for StaticMembership {
    async fn create(
        &self,
        advertise_addr: &str,
        join_addr: Option<&str>,
        tags: &AgentTags,
    ) -> ClusterResult<()> {
        if self.shared.local().is_some() {
            return Err(ClusterError::AlreadyCreated);
        }

        advertise_addr
            .parse::<IpAddr>()
            .map_err(|_| ClusterError::InvalidAddress(advertise_addr.to_string()))?;

        if let Some(addr) = join_addr {
            check_join_address(addr).await?;
            debug!(%addr, "join address reachable");
        }

        let peers = match &self.peers_file {
            Some(path) => PeersFile::load(path)?.members,
            None => Vec::new(),
        };

        let local = ClusterMember {
            address: advertise_addr.to_string(),
            port: tags.agent_port,
            node_name: tags.node_name.clone(),
            node_role: tags.node_role,
        };
        *self.shared.local.write().unwrap_or_else(PoisonError::into_inner) = Some(local);
        self.shared.publish(peers);

        info!(
            node = %tags.node_name,
            role = %tags.node_role,
            %advertise_addr,
            join = ?join_addr,
            members = self.shared.snapshot().len(),
            "cluster created"
        );

        if let Some(path) = &self.peers_file {
            self.spawn_refresh(path.clone());
        }

        Ok(())
    }

    fn members(&self) -> Arc<Vec<ClusterMember>> {
        self.shared.snapshot()
    }

    async fn leave(&self) {
        let task = self
            .refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                warn!(error = %e, "peers refresh task ended abnormally");
            }
        }

        let local = self
            .shared
            .local
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        *self.shared.snapshot.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(Vec::new());

        if let Some(local) = local {
            info!(node = %local.node_name, "left cluster");
        }
    }
}

async fn check_join_address(addr: &str) -> ClusterResult<()> {
    let join_err = |reason: String| ClusterError::Join {
        addr: addr.to_string(),
        reason,
    };
    match tokio::time::timeout(JOIN_TIMEOUT, tokio::net::TcpStream::connect(addr)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(join_err(e.to_string())),
        Err(_) => Err(join_err("timed out".to_string())),
    }
}
