use std::time::Duration;

use thiserror::Error;

use crate::commands::ApplyError;

pub type Result<T> = std::result::Result<T, ArimaError>;

#[derive(Debug, Error)]
pub enum ArimaError {
    /// The key (or log index) was never written, or has been removed.
    #[error("key not found")]
    NotFound,

    #[error("Storage engine error: {0}")]
    Storage(#[from] redb::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Snapshot stream is corrupt: {0}")]
    CorruptSnapshot(String),

    #[error("State machine unavailable: {0}")]
    Unavailable(String),

    #[error("Not the leader (current leader: {leader_id:?})")]
    NotLeader {
        leader_id: Option<u64>,
        leader_addr: Option<String>,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Node {0} is already a member of the cluster")]
    AlreadyMember(u64),

    #[error("Node {0} is not a member of the cluster")]
    NotMember(u64),

    #[error("Raft error: {0}")]
    Raft(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Apply failed: {0}")]
    Apply(#[from] ApplyError),
}

impl ArimaError {
    /// Lets callers implement default-value semantics without matching on the
    /// whole taxonomy.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ArimaError::NotFound | ArimaError::Apply(ApplyError::NotFound))
    }
}

// redb splits its failures per operation; they all funnel through `redb::Error`.
macro_rules! storage_error_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for ArimaError {
                fn from(err: $ty) -> Self {
                    ArimaError::Storage(err.into())
                }
            }
        )*
    };
}

storage_error_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

impl From<serde_json::Error> for ArimaError {
    fn from(err: serde_json::Error) -> Self {
        ArimaError::Encoding(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for ArimaError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ArimaError::Encoding(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ArimaError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ArimaError::Encoding(err.to_string())
    }
}

impl From<bincode::Error> for ArimaError {
    fn from(err: bincode::Error) -> Self {
        ArimaError::Encoding(err.to_string())
    }
}
