//! The membership capability consumed by the request router.

use std::sync::Arc;

use async_trait::async_trait;

use dockhand_core::{AgentTags, ClusterMember, NodeRole};

use crate::error::ClusterResult;

/// Maintains cluster topology.
///
/// Implementations must publish snapshots atomically: a reader never
/// observes a member without its tags, or a removal half applied.
#[async_trait]
pub trait ClusterService: Send + Sync {
    /// Join an existing cluster through `join_addr`, or bootstrap a new
    /// one when it is `None`, tagging this node with `tags`.
    async fn create(
        &self,
        advertise_addr: &str,
        join_addr: Option<&str>,
        tags: &AgentTags,
    ) -> ClusterResult<()>;

    /// Point-in-time snapshot of every known member, this node included.
    /// Order carries no meaning.
    fn members(&self) -> Arc<Vec<ClusterMember>>;

    /// Deregister this node. Best-effort: transport errors are logged and
    /// swallowed so shutdown never blocks on the network.
    async fn leave(&self);

    /// Any member holding `role`. Several may qualify; callers must not
    /// rely on getting a particular one.
    fn member_by_role(&self, role: NodeRole) -> Option<ClusterMember> {
        self.members()
            .iter()
            .find(|m| m.node_role == role)
            .cloned()
    }

    /// The member named `node_name`, if any.
    fn member_by_node_name(&self, node_name: &str) -> Option<ClusterMember> {
        self.members()
            .iter()
            .find(|m| m.node_name == node_name)
            .cloned()
    }
}
