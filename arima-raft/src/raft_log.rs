//! Openraft log storage over a [`LogStore`] and a [`StableStore`].
//!
//! Log entries are converted to [`LogEntry`] records; the vote, committed
//! and purge marks live in the stable store.

use std::fmt::{Debug, Display};
use std::io;
use std::ops::{Bound, RangeBounds};

use openraft::storage::{LogFlushed, LogState, RaftLogReader, RaftLogStorage};
use openraft::{
    BasicNode, CommittedLeaderId, Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, Membership,
    OptionalSend, StorageError, Vote,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::codec;
use crate::errors::{ArimaError, Result};
use crate::log_store::{EntryKind, LogEntry, LogStore};
use crate::stable_store::StableStore;
use crate::typ::TypeConfig;

type NodeId = u64;

const VOTE_KEY: &[u8] = b"vote";
const CURRENT_TERM_KEY: &[u8] = b"current_term";
const COMMITTED_KEY: &[u8] = b"committed";
const PURGED_KEY: &[u8] = b"last_purged";

/// Openraft log storage adapter.
#[derive(Clone)]
pub struct RaftLogAdapter<L, S> {
    log: L,
    stable: S,
}

impl<L, S> RaftLogAdapter<L, S>
where
    L: LogStore + Clone + 'static,
    S: StableStore + Clone + 'static,
{
    pub fn new(log: L, stable: S) -> Self {
        Self { log, stable }
    }

    fn read_mark<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.stable.get(key) {
            Ok(bytes) => Ok(Some(codec::decode_meta(&bytes)?)),
            Err(ArimaError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn write_mark<T: Serialize>(&self, key: &[u8], value: &T) -> Result<()> {
        self.stable.set(key, &codec::encode_meta(value)?)
    }

    /// Entry with the highest index, if any. Index 0 is a valid index, so
    /// an empty store is told apart by probing it.
    fn last_entry(&self) -> Result<Option<LogEntry>> {
        let last = self.log.last_index()?;
        match self.log.get_log(last) {
            Ok(entry) => Ok(Some(entry)),
            Err(ArimaError::NotFound) if last == 0 => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl<L, S> RaftLogReader<TypeConfig> for RaftLogAdapter<L, S>
where
    L: LogStore + Clone + 'static,
    S: StableStore + Clone + 'static,
{
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> std::result::Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let min = match range.start_bound() {
            Bound::Included(&i) => i,
            Bound::Excluded(&i) => i.saturating_add(1),
            Bound::Unbounded => 0,
        };
        let max = match range.end_bound() {
            Bound::Included(&i) => i,
            Bound::Excluded(&0) => return Ok(Vec::new()),
            Bound::Excluded(&i) => i - 1,
            Bound::Unbounded => u64::MAX,
        };

        let records = self
            .log
            .get_logs(min, max)
            .map_err(|e| store_err(ErrorVerb::Read, "read log range", e))?;
        records
            .into_iter()
            .map(|record| from_log_entry(record).map_err(|e| store_err(ErrorVerb::Read, "decode entry", e)))
            .collect()
    }
}

impl<L, S> RaftLogStorage<TypeConfig> for RaftLogAdapter<L, S>
where
    L: LogStore + Clone + 'static,
    S: StableStore + Clone + 'static,
{
    type LogReader = Self;

    async fn get_log_state(&mut self) -> std::result::Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last_purged: Option<LogId<NodeId>> = self
            .read_mark(PURGED_KEY)
            .map_err(|e| store_err(ErrorVerb::Read, "read last_purged", e))?;
        let last = self
            .last_entry()
            .map_err(|e| store_err(ErrorVerb::Read, "read last entry", e))?;

        let last_log_id = match last {
            Some(entry) => Some(log_id_of(&entry)),
            None => last_purged,
        };

        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> std::result::Result<(), StorageError<NodeId>> {
        self.write_mark(VOTE_KEY, vote)
            .and_then(|_| self.stable.set_u64(CURRENT_TERM_KEY, vote.leader_id.term))
            .map_err(|e| store_err(ErrorVerb::Write, "save vote", e))?;
        debug!(?vote, "vote saved");
        Ok(())
    }

    async fn read_vote(&mut self) -> std::result::Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        self.read_mark(VOTE_KEY)
            .map_err(|e| store_err(ErrorVerb::Read, "read vote", e))
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> std::result::Result<(), StorageError<NodeId>> {
        if let Some(c) = &committed {
            self.write_mark(COMMITTED_KEY, c)
                .map_err(|e| store_err(ErrorVerb::Write, "save committed", e))?;
        }
        Ok(())
    }

    async fn read_committed(&mut self) -> std::result::Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        self.read_mark(COMMITTED_KEY)
            .map_err(|e| store_err(ErrorVerb::Read, "read committed", e))
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> std::result::Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let records = entries
            .into_iter()
            .map(|entry| to_log_entry(&entry))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| store_err(ErrorVerb::Write, "encode entry", e))?;

        self.log
            .store_logs(&records)
            .map_err(|e| store_err(ErrorVerb::Write, "append entries", e))?;

        // Every store commits its own transaction; the entries are durable here.
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> std::result::Result<(), StorageError<NodeId>> {
        self.log
            .delete_range(log_id.index, u64::MAX)
            .map_err(|e| store_err(ErrorVerb::Delete, "truncate log", e))?;
        debug!(?log_id, "log truncated");
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> std::result::Result<(), StorageError<NodeId>> {
        self.write_mark(PURGED_KEY, &log_id)
            .and_then(|_| {
                let first = self.log.first_index()?;
                self.log.delete_range(first, log_id.index)
            })
            .map_err(|e| store_err(ErrorVerb::Delete, "purge log", e))?;
        debug!(?log_id, "log purged");
        Ok(())
    }
}

pub(crate) fn log_id_of(entry: &LogEntry) -> LogId<NodeId> {
    LogId::new(CommittedLeaderId::new(entry.term, entry.leader_id), entry.index)
}

/// Convert an openraft entry into the record kept by the [`LogStore`].
pub(crate) fn to_log_entry(entry: &Entry<TypeConfig>) -> Result<LogEntry> {
    let (kind, data) = match &entry.payload {
        EntryPayload::Blank => (EntryKind::NoOp, Vec::new()),
        EntryPayload::Normal(cmd) => (EntryKind::Command, codec::encode_command(cmd)?),
        EntryPayload::Membership(membership) => {
            (EntryKind::Configuration, codec::encode_meta(membership)?)
        }
    };
    Ok(LogEntry {
        index: entry.log_id.index,
        term: entry.log_id.leader_id.term,
        leader_id: entry.log_id.leader_id.node_id,
        kind,
        data,
    })
}

pub(crate) fn from_log_entry(record: LogEntry) -> Result<Entry<TypeConfig>> {
    let payload = match record.kind {
        EntryKind::NoOp => EntryPayload::Blank,
        EntryKind::Command => EntryPayload::Normal(codec::decode_command(&record.data)?),
        EntryKind::Configuration => {
            let membership: Membership<NodeId, BasicNode> = codec::decode_meta(&record.data)?;
            EntryPayload::Membership(membership)
        }
    };
    Ok(Entry {
        log_id: log_id_of(&record),
        payload,
    })
}

pub(crate) fn store_err(verb: ErrorVerb, context: &str, e: impl Display) -> StorageError<NodeId> {
    StorageError::from_io_error(
        ErrorSubject::Store,
        verb,
        io::Error::other(format!("{context}: {e}")),
    )
}
