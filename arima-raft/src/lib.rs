//! `arima-raft`: durable storage and a replicated key/value state machine
//! for a Raft consensus node.
//!
//! Uses `openraft` for consensus and `redb` for the log, the consensus
//! metadata and the state machine. Snapshots are written to plain files.

pub mod codec;
pub mod commands;
pub mod config;
pub mod engine;
pub mod errors;
pub mod leadership;
pub mod log_store;
pub mod network;
pub mod node;
pub mod raft_fsm;
pub mod raft_log;
pub mod snapshot;
pub mod snapshot_store;
pub mod stable_store;
pub mod state_machine;
pub mod typ;

pub use commands::{ApplyError, ApplyResponse, Command};
pub use config::NodeConfig;
pub use errors::{ArimaError, Result};
pub use node::{ArimaNode, NodeStats};

/// Re-export openraft types needed by embedders.
pub use openraft::{BasicNode, Raft, ServerState};
