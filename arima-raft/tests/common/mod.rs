//! Shared test helpers for `arima-raft` integration tests.
//!
//! Nodes talk through a [`LocalRouter`], so a whole cluster runs inside the
//! test process. Each node gets its own temp directory and a unique address.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Once;
use std::time::Duration;

use arima_raft::network::LocalRouter;
use arima_raft::{ArimaNode, NodeConfig};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Global port counter so parallel tests don't collide.
static PORT: AtomicU16 = AtomicU16::new(27650);
static TRACING: Once = Once::new();

pub const LEADER_TIMEOUT: Duration = Duration::from_secs(10);

fn next_addr() -> SocketAddr {
    let port = PORT.fetch_add(1, Ordering::Relaxed);
    format!("127.0.0.1:{}", port).parse().unwrap()
}

/// Install a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Config tuned for fast elections in tests.
pub fn test_config(dir: &TempDir, node_id: u64) -> NodeConfig {
    let mut config = NodeConfig::new(dir.path(), next_addr());
    config.node_id = Some(node_id);
    config.heartbeat_interval = Duration::from_millis(50);
    config.election_timeout_min = Duration::from_millis(150);
    config.election_timeout_max = Duration::from_millis(300);
    config.apply_timeout = Duration::from_secs(5);
    config
}

/// Start a node and make it reachable through `router`.
pub async fn start_node(router: &LocalRouter, config: NodeConfig) -> ArimaNode {
    let node_id = config.node_id.expect("test nodes have explicit ids");
    let node = ArimaNode::start(config, router.network_for(node_id))
        .await
        .expect("start node");
    router.register(node_id, node.raft().clone()).await;
    node
}

pub struct TestCluster {
    pub router: LocalRouter,
    pub nodes: Vec<ArimaNode>,
    /// Must outlive the nodes; dropping a dir removes its databases.
    pub dirs: Vec<TempDir>,
}

impl TestCluster {
    /// Node with id `id` (ids start at 1).
    pub fn node(&self, id: u64) -> &ArimaNode {
        self.nodes
            .iter()
            .find(|n| n.node_id() == id)
            .expect("node in cluster")
    }

    pub async fn leader(&self) -> &ArimaNode {
        let leader = self.nodes[0]
            .wait_for_leader(LEADER_TIMEOUT)
            .await
            .expect("leader elected");
        self.node(leader)
    }

    pub fn followers(&self, leader: u64) -> Vec<&ArimaNode> {
        self.nodes.iter().filter(|n| n.node_id() != leader).collect()
    }
}

/// Start `size` nodes with ids `1..=size`, bootstrap them as one cluster
/// and wait for a leader.
pub async fn start_cluster(size: u64) -> TestCluster {
    start_cluster_with(size, |_| {}).await
}

pub async fn start_cluster_with(size: u64, tweak: impl Fn(&mut NodeConfig)) -> TestCluster {
    init_tracing();
    let router = LocalRouter::new();
    let mut nodes = Vec::new();
    let mut dirs = Vec::new();

    for id in 1..=size {
        let dir = TempDir::new().expect("create temp dir");
        let mut config = test_config(&dir, id);
        tweak(&mut config);
        nodes.push(start_node(&router, config).await);
        dirs.push(dir);
    }

    let members: BTreeMap<u64, String> = nodes
        .iter()
        .map(|n| (n.node_id(), n.config().raft_addr.to_string()))
        .collect();
    nodes[0].initialize(members).await.expect("bootstrap cluster");

    // Every node must know the leader before tests rely on leader hints.
    for node in &nodes {
        node.wait_for_leader(LEADER_TIMEOUT)
            .await
            .expect("leader known");
    }

    TestCluster { router, nodes, dirs }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
