//! In-process Raft network transport.
//!
//! Routes RPCs between nodes living in the same process. Every request and
//! response is JSON-serialized on the way through, exactly like a wire
//! transport would, so nothing is shared between peers by reference.
//! A node can be isolated to simulate a partition.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use openraft::error::{
    Fatal, InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, ReplicationClosed,
    StreamingError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    SnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::storage::Snapshot;
use openraft::{BasicNode, OptionalSend, Raft, Vote};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::typ::TypeConfig;

type NodeId = u64;
type Node = BasicNode;

#[derive(Default)]
struct RouterState {
    nodes: BTreeMap<NodeId, Raft<TypeConfig>>,
    isolated: BTreeSet<NodeId>,
}

/// Registry of the Raft handles reachable in this process.
#[derive(Clone, Default)]
pub struct LocalRouter {
    state: Arc<RwLock<RouterState>>,
}

impl LocalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: NodeId, raft: Raft<TypeConfig>) {
        self.state.write().await.nodes.insert(id, raft);
        info!(node_id = id, "node registered with local router");
    }

    pub async fn unregister(&self, id: NodeId) {
        self.state.write().await.nodes.remove(&id);
    }

    /// Drop every RPC to or from `id` until [`LocalRouter::heal`].
    pub async fn isolate(&self, id: NodeId) {
        self.state.write().await.isolated.insert(id);
        warn!(node_id = id, "node isolated");
    }

    pub async fn heal(&self, id: NodeId) {
        self.state.write().await.isolated.remove(&id);
        info!(node_id = id, "node reconnected");
    }

    /// Network factory for the node `source`.
    pub fn network_for(&self, source: NodeId) -> LocalNetworkFactory {
        LocalNetworkFactory {
            router: self.clone(),
            source,
        }
    }

    async fn route(&self, source: NodeId, target: NodeId) -> Option<Raft<TypeConfig>> {
        let state = self.state.read().await;
        if state.isolated.contains(&source) || state.isolated.contains(&target) {
            return None;
        }
        state.nodes.get(&target).cloned()
    }
}

/// Creates a [`LocalNetwork`] for each target node.
#[derive(Clone)]
pub struct LocalNetworkFactory {
    router: LocalRouter,
    source: NodeId,
}

impl RaftNetworkFactory<TypeConfig> for LocalNetworkFactory {
    type Network = LocalNetwork;

    async fn new_client(&mut self, target: NodeId, node: &Node) -> Self::Network {
        LocalNetwork {
            router: self.router.clone(),
            source: self.source,
            target,
            addr: node.addr.clone(),
            connected: true,
        }
    }
}

/// Connection from one node to a single peer.
pub struct LocalNetwork {
    router: LocalRouter,
    source: NodeId,
    target: NodeId,
    addr: String,
    /// Used to log reachability transitions once instead of on every RPC.
    connected: bool,
}

impl LocalNetwork {
    async fn peer<E: std::error::Error>(&mut self) -> Result<Raft<TypeConfig>, RPCError<NodeId, Node, E>> {
        match self.router.route(self.source, self.target).await {
            Some(raft) => {
                self.mark_success();
                Ok(raft)
            }
            None => {
                self.mark_failure();
                let e = std::io::Error::other(format!("node {} unreachable", self.target));
                Err(RPCError::Unreachable(Unreachable::new(&e)))
            }
        }
    }

    fn mark_success(&mut self) {
        if !self.connected {
            info!(target_node = self.target, addr = %self.addr, "peer is reachable");
            self.connected = true;
        }
    }

    fn mark_failure(&mut self) {
        if self.connected {
            warn!(target_node = self.target, addr = %self.addr, "peer became unreachable");
            self.connected = false;
        }
    }

    fn remote_err<E: std::error::Error>(&self, e: E) -> RPCError<NodeId, Node, E> {
        RPCError::RemoteError(RemoteError::new(self.target, e))
    }
}

impl RaftNetwork<TypeConfig> for LocalNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, Node, RaftError<NodeId>>> {
        let raft = self.peer().await?;
        let resp = raft
            .append_entries(over_wire(&rpc)?)
            .await
            .map_err(|e| self.remote_err(e))?;
        over_wire(&resp)
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, Node, RaftError<NodeId>>> {
        let raft = self.peer().await?;
        let resp = raft
            .vote(over_wire(&rpc)?)
            .await
            .map_err(|e| self.remote_err(e))?;
        over_wire(&resp)
    }

    async fn full_snapshot(
        &mut self,
        vote: Vote<NodeId>,
        snapshot: Snapshot<TypeConfig>,
        _cancel: impl Future<Output = ReplicationClosed> + OptionalSend + 'static,
        option: RPCOption,
    ) -> Result<SnapshotResponse<NodeId>, StreamingError<TypeConfig, Fatal<NodeId>>> {
        let data = snapshot.snapshot.into_inner();
        let resp = self
            .install_snapshot(
                InstallSnapshotRequest {
                    vote,
                    meta: snapshot.meta.clone(),
                    offset: 0,
                    data,
                    done: true,
                },
                option,
            )
            .await
            .map_err(|e| {
                warn!(?e, "install_snapshot failed");
                let io = std::io::Error::other(e.to_string());
                StreamingError::Unreachable(Unreachable::new(&io))
            })?;

        Ok(SnapshotResponse { vote: resp.vote })
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, Node, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let raft = self.peer().await?;
        let resp = raft
            .install_snapshot(over_wire(&rpc)?)
            .await
            .map_err(|e| self.remote_err(e))?;
        over_wire(&resp)
    }
}

/// Serialize and deserialize `value`, as a network hop would.
fn over_wire<T, E>(value: &T) -> Result<T, RPCError<NodeId, Node, E>>
where
    T: Serialize + DeserializeOwned,
    E: std::error::Error,
{
    let bytes = serde_json::to_vec(value).map_err(|e| net_err(&e))?;
    serde_json::from_slice(&bytes).map_err(|e| net_err(&e))
}

fn net_err<E: std::error::Error>(e: &(impl std::error::Error + 'static)) -> RPCError<NodeId, Node, E> {
    RPCError::Network(NetworkError::new(e))
}
