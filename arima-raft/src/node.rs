//! Node lifecycle and client API.
//!
//! [`ArimaNode::start`] wires the stores, the state machine and the snapshot
//! store into an openraft instance. Writes go through the replicated log on
//! the leader; followers answer with [`ArimaError::NotLeader`] so the caller
//! can retry against the right node.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use openraft::error::{ClientWriteError, RaftError};
use openraft::network::RaftNetworkFactory;
use openraft::{BasicNode, Raft, ServerState};
use rand::Rng;
use tracing::{info, warn};

use crate::commands::{ApplyError, ApplyResponse, Command};
use crate::config::NodeConfig;
use crate::engine::Engine;
use crate::errors::{ArimaError, Result};
use crate::leadership::LeadershipHandle;
use crate::log_store::RedbLogStore;
use crate::raft_fsm::RaftFsmAdapter;
use crate::raft_log::RaftLogAdapter;
use crate::snapshot_store::FileSnapshotStore;
use crate::stable_store::RedbStableStore;
use crate::state_machine::{ArimaFsm, FsmReader};
use crate::typ::TypeConfig;

const NODE_ID_FILE: &str = "node_id";
const RAFT_DB: &str = "raft.redb";
const FSM_DB: &str = "fsm.redb";
const SNAPSHOT_DIR: &str = "snapshots";

/// Point-in-time view of a node's consensus status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStats {
    pub node_id: u64,
    pub state: ServerState,
    pub current_term: u64,
    pub current_leader: Option<u64>,
    pub last_log_index: Option<u64>,
    pub last_applied_index: Option<u64>,
    pub voters: Vec<u64>,
}

/// A running consensus node with its replicated KV state machine.
pub struct ArimaNode {
    raft: Raft<TypeConfig>,
    node_id: u64,
    config: NodeConfig,
    reader: FsmReader,
}

impl ArimaNode {
    /// Read, adopt or generate the stable node identity.
    ///
    /// A configured id always wins and is persisted; otherwise the id in
    /// `{data_dir}/node_id` is used, or a random one is generated on first boot.
    fn resolve_node_id(data_dir: &Path, configured: Option<u64>) -> anyhow::Result<u64> {
        let id_path = data_dir.join(NODE_ID_FILE);
        let persisted = if id_path.exists() {
            let contents = fs::read_to_string(&id_path)?;
            let id: u64 = contents
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid node_id file: {}", e))?;
            Some(id)
        } else {
            None
        };

        let id = match (configured, persisted) {
            (Some(configured), Some(persisted)) if configured != persisted => {
                warn!(configured, persisted, "configured node_id differs from the persisted one");
                configured
            }
            (Some(id), _) | (None, Some(id)) => id,
            (None, None) => {
                let mut rng = rand::rng();
                let mut id: u64 = rng.random();
                while id == 0 {
                    id = rng.random();
                }
                info!(node_id = id, path = %id_path.display(), "generated new stable node_id");
                id
            }
        };

        if persisted != Some(id) {
            fs::write(&id_path, id.to_string())?;
        }
        Ok(id)
    }

    /// Open the node's storage and start its consensus engine.
    ///
    /// This does NOT bootstrap the cluster; call [`ArimaNode::initialize`] on
    /// the first node only.
    pub async fn start<N>(config: NodeConfig, network: N) -> anyhow::Result<Self>
    where
        N: RaftNetworkFactory<TypeConfig>,
    {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create data dir {}", config.data_dir.display()))?;
        let node_id = Self::resolve_node_id(&config.data_dir, config.node_id)?;

        let raft_config = config.raft_config()?;

        let (raft_engine, fsm_engine) = open_engines(&config)?;
        let log_store = RaftLogAdapter::new(
            RedbLogStore::new(raft_engine.clone())?,
            RedbStableStore::new(raft_engine)?,
        );

        let fsm = ArimaFsm::new(fsm_engine)?;
        let reader = fsm.reader();
        let snapshots =
            FileSnapshotStore::open(config.data_dir.join(SNAPSHOT_DIR), config.snapshot_retain)?;
        let state_machine = RaftFsmAdapter::new(fsm, snapshots);

        let raft = Raft::new(node_id, raft_config, network, log_store, state_machine).await?;

        info!(node_id, raft_addr = %config.raft_addr, "node started");
        Ok(Self {
            raft,
            node_id,
            config,
            reader,
        })
    }

    /// Bootstrap the cluster with `members` (id to transport address). An
    /// empty map bootstraps a single-node cluster of this node.
    pub async fn initialize(&self, members: BTreeMap<u64, String>) -> Result<()> {
        let members: BTreeMap<u64, BasicNode> = if members.is_empty() {
            BTreeMap::from([(self.node_id, BasicNode::new(self.config.raft_addr))])
        } else {
            members
                .into_iter()
                .map(|(id, addr)| (id, BasicNode::new(addr)))
                .collect()
        };
        let voters: Vec<u64> = members.keys().copied().collect();

        self.raft
            .initialize(members)
            .await
            .map_err(|e| ArimaError::Raft(e.to_string()))?;
        info!(node_id = self.node_id, ?voters, "cluster initialized");
        Ok(())
    }

    /// Upsert `key`. Leader only.
    pub async fn set(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<()> {
        let cmd = Command::Set {
            key: key.into(),
            value: value.into(),
        };
        self.propose(cmd).await?.into_result().map_err(apply_err)?;
        Ok(())
    }

    /// Remove `key`; removing an absent key succeeds. Leader only.
    pub async fn delete(&self, key: impl Into<Vec<u8>>) -> Result<()> {
        let cmd = Command::Delete { key: key.into() };
        self.propose(cmd).await?.into_result().map_err(apply_err)?;
        Ok(())
    }

    /// Read `key` from the leader's local state machine.
    pub async fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.ensure_leader()?;
        self.reader.get(key)
    }

    /// Read `key` through the replicated log, observing every write
    /// committed before it.
    pub async fn get_consistent(&self, key: &[u8]) -> Result<Vec<u8>> {
        let cmd = Command::Get { key: key.to_vec() };
        let data = self.propose(cmd).await?.into_result().map_err(apply_err)?;
        data.ok_or(ArimaError::NotFound)
    }

    /// Add a node as a voter. Leader only.
    pub async fn join(&self, id: u64, addr: impl Into<String>) -> Result<()> {
        self.ensure_leader()?;
        let mut voters = self.voters();
        if voters.contains(&id) {
            return Err(ArimaError::AlreadyMember(id));
        }

        let addr = addr.into();
        self.raft
            .add_learner(id, BasicNode::new(&addr), true)
            .await
            .map_err(|e| self.write_err(e))?;
        info!(node_id = id, %addr, "learner added");

        voters.insert(id);
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(|e| self.write_err(e))?;
        info!(node_id = id, "node promoted to voter");
        Ok(())
    }

    /// Remove a node from the cluster. Leader only.
    pub async fn leave(&self, id: u64) -> Result<()> {
        self.ensure_leader()?;
        let mut voters = self.voters();
        let is_learner = {
            let metrics = self.raft.metrics().borrow().clone();
            let found = metrics.membership_config.membership().learner_ids().any(|l| l == id);
            found
        };
        if !voters.remove(&id) && !is_learner {
            return Err(ArimaError::NotMember(id));
        }

        self.raft
            .change_membership(voters, false)
            .await
            .map_err(|e| self.write_err(e))?;
        info!(node_id = id, "node removed from cluster");
        Ok(())
    }

    pub fn stats(&self) -> NodeStats {
        let metrics = self.raft.metrics().borrow().clone();
        NodeStats {
            node_id: self.node_id,
            state: metrics.state,
            current_term: metrics.current_term,
            current_leader: metrics.current_leader,
            last_log_index: metrics.last_log_index,
            last_applied_index: metrics.last_applied.map(|id| id.index),
            voters: metrics.membership_config.membership().voter_ids().collect(),
        }
    }

    /// Wait until some node is known as leader and return its id.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<u64> {
        let metrics = self
            .raft
            .wait(Some(timeout))
            .metrics(|m| m.current_leader.is_some(), "leader elected")
            .await
            .map_err(|_| ArimaError::Timeout(timeout))?;
        metrics.current_leader.ok_or(ArimaError::Timeout(timeout))
    }

    /// Create a lightweight handle for querying leadership status.
    pub fn leadership_handle(&self) -> LeadershipHandle {
        LeadershipHandle::new(self.raft.clone(), self.node_id)
    }

    /// Read handle over this node's local state machine.
    pub fn reader(&self) -> FsmReader {
        self.reader.clone()
    }

    pub fn raft(&self) -> &Raft<TypeConfig> {
        &self.raft
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.raft
            .shutdown()
            .await
            .map_err(|e| ArimaError::Raft(e.to_string()))?;
        info!(node_id = self.node_id, "node stopped");
        Ok(())
    }

    async fn propose(&self, cmd: Command) -> Result<ApplyResponse> {
        let timeout = self.config.apply_timeout;
        match tokio::time::timeout(timeout, self.raft.client_write(cmd)).await {
            Ok(Ok(resp)) => Ok(resp.data),
            Ok(Err(e)) => Err(self.write_err(e)),
            Err(_) => {
                warn!(node_id = self.node_id, ?timeout, "proposal timed out");
                Err(ArimaError::Timeout(timeout))
            }
        }
    }

    fn ensure_leader(&self) -> Result<()> {
        let handle = self.leadership_handle();
        if handle.is_leader() {
            return Ok(());
        }
        Err(ArimaError::NotLeader {
            leader_id: handle.current_leader(),
            leader_addr: handle.current_leader_addr(),
        })
    }

    fn voters(&self) -> BTreeSet<u64> {
        let metrics = self.raft.metrics().borrow().clone();
        metrics.membership_config.membership().voter_ids().collect()
    }

    fn write_err(&self, e: RaftError<u64, ClientWriteError<u64, BasicNode>>) -> ArimaError {
        match e {
            RaftError::APIError(ClientWriteError::ForwardToLeader(fwd)) => ArimaError::NotLeader {
                leader_id: fwd.leader_id,
                leader_addr: fwd.leader_node.map(|n| n.addr),
            },
            other => {
                warn!(node_id = self.node_id, error = %other, "write rejected");
                ArimaError::Raft(other.to_string())
            }
        }
    }
}

fn apply_err(e: ApplyError) -> ArimaError {
    match e {
        ApplyError::NotFound => ArimaError::NotFound,
        other => ArimaError::Apply(other),
    }
}

/// Open the raft and state machine databases.
///
/// Votes, terms and log entries are acknowledged to the consensus engine as
/// flushed, so the raft database always commits durably. `sync_writes` only
/// relaxes the state machine, which is rebuilt from the log after a crash.
fn open_engines(config: &NodeConfig) -> anyhow::Result<(Engine, Engine)> {
    let raft_engine = Engine::open(config.data_dir.join(RAFT_DB), true)
        .context("Failed to open raft log database")?;
    let fsm_engine = Engine::open(config.data_dir.join(FSM_DB), config.sync_writes)
        .context("Failed to open state machine database")?;
    Ok((raft_engine, fsm_engine))
}
