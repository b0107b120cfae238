//! Cloneable handle for querying leadership status.

use openraft::Raft;

use crate::typ::TypeConfig;

/// Answers "is this node the leader, and if not, who is?".
#[derive(Clone)]
pub struct LeadershipHandle {
    raft: Raft<TypeConfig>,
    node_id: u64,
}

impl LeadershipHandle {
    pub fn new(raft: Raft<TypeConfig>, node_id: u64) -> Self {
        Self { raft, node_id }
    }

    pub fn is_leader(&self) -> bool {
        self.current_leader() == Some(self.node_id)
    }

    /// The node ID of the current leader, if one is known.
    pub fn current_leader(&self) -> Option<u64> {
        self.raft.metrics().borrow().current_leader
    }

    /// Transport address of the current leader, as recorded in the membership.
    pub fn current_leader_addr(&self) -> Option<String> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader?;
        metrics
            .membership_config
            .membership()
            .get_node(&leader)
            .map(|node| node.addr.clone())
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }
}

impl std::fmt::Debug for LeadershipHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeadershipHandle")
            .field("node_id", &self.node_id)
            .field("is_leader", &self.is_leader())
            .finish()
    }
}
