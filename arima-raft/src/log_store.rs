//! Persistent replicated-log storage backed by `redb`.
//!
//! Entries are stored under the 8-byte big-endian encoding of their index so
//! that range scans over the table visit them in index order.

use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec;
use crate::engine::{BytesTable, Engine};
use crate::errors::{ArimaError, Result};

const LOG_TABLE: BytesTable = TableDefinition::new("raft_log");

/// What an entry carries.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// Application command, `data` is an encoded `Command`.
    Command,
    /// Cluster configuration change, `data` is opaque to this crate.
    Configuration,
    /// Leader no-op, `data` is empty.
    NoOp,
}

/// A single entry in the replicated log.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    /// Node that created the entry; 0 when unknown.
    pub leader_id: u64,
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

impl LogEntry {
    pub fn command(index: u64, term: u64, data: Vec<u8>) -> Self {
        Self {
            index,
            term,
            leader_id: 0,
            kind: EntryKind::Command,
            data,
        }
    }

    pub fn no_op(index: u64, term: u64) -> Self {
        Self {
            index,
            term,
            leader_id: 0,
            kind: EntryKind::NoOp,
            data: Vec::new(),
        }
    }
}

/// Durable, ordered storage of log entries addressable by index.
pub trait LogStore: Send + Sync {
    /// Lowest stored index, 0 when empty.
    fn first_index(&self) -> Result<u64>;

    /// Highest stored index, 0 when empty.
    fn last_index(&self) -> Result<u64>;

    /// Fails with [`ArimaError::NotFound`] when `index` is absent.
    fn get_log(&self, index: u64) -> Result<LogEntry>;

    /// Contiguous entries in `[min, max]`, starting at the first stored index
    /// at or after `min` and stopping at the next gap.
    fn get_logs(&self, min: u64, max: u64) -> Result<Vec<LogEntry>>;

    fn store_log(&self, entry: &LogEntry) -> Result<()>;

    /// Store entries one transaction each. The first failure aborts the
    /// remaining entries; entries already written stay written.
    fn store_logs(&self, entries: &[LogEntry]) -> Result<()> {
        for entry in entries {
            self.store_log(entry)?;
        }
        Ok(())
    }

    /// Atomically delete every entry with index in `[min, max]`.
    fn delete_range(&self, min: u64, max: u64) -> Result<()>;
}

/// [`LogStore`] over a dedicated table of an [`Engine`].
#[derive(Clone)]
pub struct RedbLogStore {
    engine: Engine,
}

impl RedbLogStore {
    pub fn new(engine: Engine) -> Result<Self> {
        engine.ensure_table(LOG_TABLE)?;
        Ok(Self { engine })
    }
}

impl LogStore for RedbLogStore {
    fn first_index(&self) -> Result<u64> {
        self.engine.view(|txn| {
            let table = txn.open_table(LOG_TABLE)?;
            let first = table.first()?;
            match first {
                Some((key, _)) => codec::key_to_u64(key.value()),
                None => Ok(0),
            }
        })
    }

    fn last_index(&self) -> Result<u64> {
        self.engine.view(|txn| {
            let table = txn.open_table(LOG_TABLE)?;
            let last = table.iter()?.next_back().transpose()?;
            match last {
                Some((key, _)) => codec::key_to_u64(key.value()),
                None => Ok(0),
            }
        })
    }

    fn get_log(&self, index: u64) -> Result<LogEntry> {
        let key = codec::u64_to_key(index);
        self.engine.view(|txn| {
            let table = txn.open_table(LOG_TABLE)?;
            let value = table.get(key.as_slice())?;
            match value {
                Some(bytes) => codec::decode_record(bytes.value()),
                None => Err(ArimaError::NotFound),
            }
        })
    }

    fn get_logs(&self, min: u64, max: u64) -> Result<Vec<LogEntry>> {
        if min > max {
            return Ok(Vec::new());
        }
        let start = codec::u64_to_key(min);
        self.engine.view(|txn| {
            let table = txn.open_table(LOG_TABLE)?;
            let mut entries = Vec::new();
            // A purged prefix below `min` is skipped; only later gaps end the run.
            let mut expected: Option<u64> = None;
            for item in table.range::<&[u8]>(start.as_slice()..)? {
                let (key, value) = item?;
                let index = codec::key_to_u64(key.value())?;
                if index > max || expected.is_some_and(|e| index != e) {
                    break;
                }
                entries.push(codec::decode_record(value.value())?);
                if index == u64::MAX {
                    break;
                }
                expected = Some(index + 1);
            }
            Ok(entries)
        })
    }

    fn store_log(&self, entry: &LogEntry) -> Result<()> {
        let key = codec::u64_to_key(entry.index);
        let bytes = codec::encode_record(entry)?;
        self.engine.update(|txn| {
            txn.open_table(LOG_TABLE)?
                .insert(key.as_slice(), bytes.as_slice())?;
            Ok(())
        })
    }

    fn delete_range(&self, min: u64, max: u64) -> Result<()> {
        if min > max {
            return Ok(());
        }
        let start = codec::u64_to_key(min);
        let removed = self.engine.update(|txn| {
            let mut table = txn.open_table(LOG_TABLE)?;

            // Seek to `min` and walk forward until the first index past `max`.
            let doomed = {
                let mut keys = Vec::new();
                for item in table.range::<&[u8]>(start.as_slice()..)? {
                    let (key, _) = item?;
                    if codec::key_to_u64(key.value())? > max {
                        break;
                    }
                    keys.push(key.value().to_vec());
                }
                keys
            };

            for key in &doomed {
                table.remove(key.as_slice())?;
            }
            Ok(doomed.len())
        })?;

        debug!(min, max, removed, "log range deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> RedbLogStore {
        let engine = Engine::open(dir.path().join("raft.redb"), true).unwrap();
        RedbLogStore::new(engine).unwrap()
    }

    fn entry(index: u64) -> LogEntry {
        LogEntry::command(index, 1, format!("cmd-{index}").into_bytes())
    }

    #[test]
    fn empty_store_reports_zero_indices() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        assert_eq!(store.first_index().unwrap(), 0);
        assert_eq!(store.last_index().unwrap(), 0);
    }

    #[test]
    fn indices_follow_numeric_order_across_byte_boundaries() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.store_logs(&[entry(256), entry(5), entry(70_000)]).unwrap();

        assert_eq!(store.first_index().unwrap(), 5);
        assert_eq!(store.last_index().unwrap(), 70_000);
    }

    #[test]
    fn missing_entry_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.store_log(&entry(1)).unwrap();

        assert!(matches!(store.get_log(2), Err(ArimaError::NotFound)));
    }

    #[test]
    fn get_logs_stops_at_gap() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.store_logs(&[entry(1), entry(2), entry(4)]).unwrap();

        let got: Vec<u64> = store.get_logs(1, 4).unwrap().iter().map(|e| e.index).collect();
        assert_eq!(got, vec![1, 2]);
        let got: Vec<u64> = store.get_logs(3, 4).unwrap().iter().map(|e| e.index).collect();
        assert_eq!(got, vec![4]);
    }

    #[test]
    fn get_logs_skips_purged_prefix() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let entries: Vec<LogEntry> = (1..=5).map(entry).collect();
        store.store_logs(&entries).unwrap();
        store.delete_range(1, 2).unwrap();

        let got: Vec<u64> = store.get_logs(0, u64::MAX).unwrap().iter().map(|e| e.index).collect();
        assert_eq!(got, vec![3, 4, 5]);
    }

    /// Store that refuses to write one index.
    struct FailingStore {
        inner: RedbLogStore,
        fail_at: u64,
    }

    impl LogStore for FailingStore {
        fn first_index(&self) -> Result<u64> {
            self.inner.first_index()
        }

        fn last_index(&self) -> Result<u64> {
            self.inner.last_index()
        }

        fn get_log(&self, index: u64) -> Result<LogEntry> {
            self.inner.get_log(index)
        }

        fn get_logs(&self, min: u64, max: u64) -> Result<Vec<LogEntry>> {
            self.inner.get_logs(min, max)
        }

        fn store_log(&self, entry: &LogEntry) -> Result<()> {
            if entry.index == self.fail_at {
                return Err(ArimaError::Io(std::io::Error::other("disk full")));
            }
            self.inner.store_log(entry)
        }

        fn delete_range(&self, min: u64, max: u64) -> Result<()> {
            self.inner.delete_range(min, max)
        }
    }

    #[test]
    fn failed_batch_keeps_earlier_entries() {
        let dir = TempDir::new().unwrap();
        let store = FailingStore {
            inner: store(&dir),
            fail_at: 2,
        };

        let err = store.store_logs(&[entry(1), entry(2), entry(3)]).unwrap_err();

        assert!(matches!(err, ArimaError::Io(_)));
        assert_eq!(store.get_log(1).unwrap(), entry(1));
        assert!(matches!(store.get_log(2), Err(ArimaError::NotFound)));
        assert!(matches!(store.get_log(3), Err(ArimaError::NotFound)));
        assert_eq!(store.last_index().unwrap(), 1);
    }

    #[test]
    fn delete_range_on_empty_store_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.delete_range(1, 10).unwrap();
        store.delete_range(10, 1).unwrap();
        assert_eq!(store.last_index().unwrap(), 0);
    }

    #[test]
    fn store_log_overwrites_same_index() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.store_log(&entry(3)).unwrap();

        let replacement = LogEntry::command(3, 2, b"newer".to_vec());
        store.store_log(&replacement).unwrap();

        assert_eq!(store.get_log(3).unwrap(), replacement);
    }
}
