//! Node configuration.
//!
//! The YAML file is read into [`LoadConfiguration`] and converted into the
//! validated [`NodeConfig`]. A few settings can be overridden from the
//! environment, which wins over the file.

use std::fs::read_to_string;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::ArimaError;

pub const ENV_NODE_ID: &str = "ARIMA_NODE_ID";
pub const ENV_DATA_DIR: &str = "ARIMA_DATA_DIR";
pub const ENV_RAFT_ADDR: &str = "ARIMA_RAFT_ADDR";

const DEFAULT_HEARTBEAT_MS: u64 = 100;
const DEFAULT_ELECTION_MIN_MS: u64 = 300;
const DEFAULT_ELECTION_MAX_MS: u64 = 600;
const DEFAULT_APPLY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 1000;
const DEFAULT_LOGS_TO_KEEP: u64 = 100;
const DEFAULT_SNAPSHOT_RETAIN: usize = 2;

/// configuration settings loaded from the config file
#[derive(Debug, Serialize, Deserialize)]
pub struct LoadConfiguration {
    /// Stable node id; generated on first boot when absent
    pub node_id: Option<u64>,
    /// Directory holding the log, state machine and snapshots
    pub data_dir: String,
    /// Consensus transport address
    pub raft: RaftAddrConfig,
    #[serde(default)]
    pub timing: Option<TimingConfig>,
    #[serde(default)]
    pub snapshots: Option<SnapshotConfig>,
    /// fsync state machine commits (defaults to true); the raft log always syncs
    pub sync_writes: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RaftAddrConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TimingConfig {
    pub heartbeat_ms: Option<u64>,
    pub election_timeout_min_ms: Option<u64>,
    pub election_timeout_max_ms: Option<u64>,
    /// How long a client write waits for its entry to be applied
    pub apply_timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Build a snapshot after this many entries since the last one
    pub threshold: Option<u64>,
    /// Log entries kept behind a snapshot for slow followers
    pub trailing_logs: Option<u64>,
    /// Snapshot files kept on disk
    pub retain: Option<usize>,
}

/// Validated settings of one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: Option<u64>,
    pub data_dir: PathBuf,
    pub raft_addr: SocketAddr,
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub apply_timeout: Duration,
    pub snapshot_threshold: u64,
    pub trailing_logs: u64,
    pub snapshot_retain: usize,
    pub sync_writes: bool,
}

impl TryFrom<LoadConfiguration> for NodeConfig {
    type Error = anyhow::Error;

    fn try_from(config: LoadConfiguration) -> Result<Self> {
        let raft_addr: SocketAddr = format!("{}:{}", config.raft.host, config.raft.port)
            .parse()
            .context("Failed to create raft_addr")?;

        let mut node = NodeConfig::new(config.data_dir, raft_addr);
        node.node_id = config.node_id;

        if let Some(timing) = config.timing {
            if let Some(ms) = timing.heartbeat_ms {
                node.heartbeat_interval = Duration::from_millis(ms);
            }
            if let Some(ms) = timing.election_timeout_min_ms {
                node.election_timeout_min = Duration::from_millis(ms);
            }
            if let Some(ms) = timing.election_timeout_max_ms {
                node.election_timeout_max = Duration::from_millis(ms);
            }
            if let Some(ms) = timing.apply_timeout_ms {
                node.apply_timeout = Duration::from_millis(ms);
            }
        }

        if let Some(snapshots) = config.snapshots {
            node.snapshot_threshold = snapshots.threshold.unwrap_or(node.snapshot_threshold);
            node.trailing_logs = snapshots.trailing_logs.unwrap_or(node.trailing_logs);
            node.snapshot_retain = snapshots.retain.unwrap_or(node.snapshot_retain);
        }

        node.sync_writes = config.sync_writes.unwrap_or(true);
        Ok(node)
    }
}

impl NodeConfig {
    /// Defaults for everything but the data directory and the address.
    pub fn new(data_dir: impl Into<PathBuf>, raft_addr: SocketAddr) -> Self {
        Self {
            node_id: None,
            data_dir: data_dir.into(),
            raft_addr,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_MS),
            election_timeout_min: Duration::from_millis(DEFAULT_ELECTION_MIN_MS),
            election_timeout_max: Duration::from_millis(DEFAULT_ELECTION_MAX_MS),
            apply_timeout: Duration::from_millis(DEFAULT_APPLY_TIMEOUT_MS),
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            trailing_logs: DEFAULT_LOGS_TO_KEEP,
            snapshot_retain: DEFAULT_SNAPSHOT_RETAIN,
            sync_writes: true,
        }
    }

    /// Load a YAML file, apply environment overrides and validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_yaml(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        info!(path = %path.display(), "node configuration loaded");
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let load_config: LoadConfiguration = serde_yaml::from_str(content)?;
        load_config.try_into()
    }

    /// Apply overrides looked up by variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup(ENV_NODE_ID) {
            let id: u64 = id
                .trim()
                .parse()
                .context(format!("Failed to parse {ENV_NODE_ID}: {id}"))?;
            self.node_id = Some(id);
        }
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(addr) = lookup(ENV_RAFT_ADDR) {
            self.raft_addr = addr
                .parse()
                .context(format!("Failed to parse into Socket address: {addr}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> std::result::Result<(), ArimaError> {
        let invalid = |msg: &str| Err(ArimaError::Config(msg.to_string()));

        if self.node_id == Some(0) {
            return invalid("node_id must be non-zero");
        }
        if self.data_dir.as_os_str().is_empty() {
            return invalid("data_dir must not be empty");
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.election_timeout_min {
            return invalid("heartbeat interval must be positive and below the election timeout");
        }
        if self.election_timeout_min >= self.election_timeout_max {
            return invalid("election_timeout_min must be below election_timeout_max");
        }
        if self.apply_timeout.is_zero() {
            return invalid("apply_timeout must be positive");
        }
        if self.snapshot_retain == 0 {
            return invalid("snapshot retain must be at least 1");
        }
        Ok(())
    }

    /// The consensus engine settings derived from this config.
    pub fn raft_config(&self) -> Result<Arc<openraft::Config>> {
        let config = openraft::Config {
            cluster_name: "arima".to_string(),
            heartbeat_interval: self.heartbeat_interval.as_millis() as u64,
            election_timeout_min: self.election_timeout_min.as_millis() as u64,
            election_timeout_max: self.election_timeout_max.as_millis() as u64,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            max_in_snapshot_log_to_keep: self.trailing_logs,
            ..openraft::Config::default()
        };
        Ok(Arc::new(config.validate()?))
    }
}
