//! Openraft type configuration for Arima.

use std::io::Cursor;

use crate::commands::{ApplyResponse, Command};

openraft::declare_raft_types!(
    /// The openraft type configuration for Arima.
    pub TypeConfig:
        D = Command,
        R = ApplyResponse,
        NodeId = u64,
        Node = openraft::BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime,
);
