//! The replicated KV state machine.
//!
//! Committed entries are applied in index order; each entry's effect and
//! the `last_applied` mark are written in the same transaction, so a replay
//! after restart skips what was already applied. Snapshots pin a redb read
//! transaction, which gives a point-in-time view without blocking applies.

use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use redb::{ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::commands::{ApplyError, ApplyResponse, Command};
use crate::engine::{self, BytesTable, Engine};
use crate::errors::{ArimaError, Result};
use crate::log_store::{EntryKind, LogEntry};
use crate::snapshot::{persist_into, SnapshotSink};

const KV_TABLE: BytesTable = TableDefinition::new("kv");
const META_TABLE: BytesTable = TableDefinition::new("fsm_meta");

/// Tables captured by a snapshot, in stream tag order.
const FSM_TABLES: [BytesTable; 2] = [KV_TABLE, META_TABLE];

const APPLIED_KEY: &[u8] = b"applied";
const RESTORE_FAILED: &str = "last snapshot restore failed";

/// Position of an entry in the log.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryMark {
    pub index: u64,
    pub term: u64,
    pub leader_id: u64,
}

impl EntryMark {
    pub fn of(entry: &LogEntry) -> Self {
        Self {
            index: entry.index,
            term: entry.term,
            leader_id: entry.leader_id,
        }
    }
}

/// The latest applied cluster configuration and where it came from.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MembershipMark {
    pub mark: EntryMark,
    pub config: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct AppliedState {
    pub last_applied: Option<EntryMark>,
    pub membership: Option<MembershipMark>,
}

impl AppliedState {
    pub fn last_index(&self) -> u64 {
        self.last_applied.map(|m| m.index).unwrap_or(0)
    }
}

/// Contract the consensus engine drives. `apply` and `restore` are never
/// called concurrently; `snapshot` may be followed by applies at any time.
pub trait StateMachine: Send + Sync + 'static {
    type Snapshot: FsmSnapshot;

    /// Apply one committed entry. Failures are reported in the response,
    /// never raised: the entry is already committed.
    fn apply(&mut self, entry: &LogEntry) -> ApplyResponse;

    fn snapshot(&self) -> Result<Self::Snapshot>;

    /// Discard all state and load it from `source`.
    fn restore(&mut self, source: &mut dyn Read) -> Result<()>;

    fn applied_state(&self) -> Result<AppliedState>;
}

/// A point-in-time snapshot handle.
pub trait FsmSnapshot: Send + Sync + 'static {
    fn applied(&self) -> &AppliedState;

    /// Stream the full state into `sink`, closing it on success and
    /// cancelling it on failure.
    fn persist<S: SnapshotSink>(&self, sink: S) -> Result<S::Closed>;

    /// The consensus engine no longer needs this snapshot.
    fn release(self);
}

enum Outcome {
    Applied(Option<Vec<u8>>),
    Rejected(ApplyError),
    Duplicate(u64),
}

/// [`StateMachine`] persisting its key space in a redb database.
pub struct ArimaFsm {
    engine: Engine,
    failed: Arc<AtomicBool>,
}

impl ArimaFsm {
    pub fn open(path: impl AsRef<Path>, sync_writes: bool) -> Result<Self> {
        Self::new(Engine::open(path, sync_writes)?)
    }

    pub fn new(engine: Engine) -> Result<Self> {
        for table in FSM_TABLES {
            engine.ensure_table(table)?;
        }
        Ok(Self {
            engine,
            failed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Cloneable read handle, usable while the consensus engine owns `self`.
    pub fn reader(&self) -> FsmReader {
        FsmReader {
            engine: self.engine.clone(),
            failed: self.failed.clone(),
        }
    }

    /// Leader-local read, bypassing the log.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.reader().get(key)
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(ArimaError::Unavailable(RESTORE_FAILED.into()));
        }
        Ok(())
    }

    fn commit_entry(&self, entry: &LogEntry) -> Result<Outcome> {
        let mark = EntryMark::of(entry);
        self.engine.update(|txn| {
            let mut meta = txn.open_table(META_TABLE)?;
            let mut applied = load_applied(&meta)?;
            if let Some(last) = applied.last_applied {
                if entry.index <= last.index {
                    return Ok(Outcome::Duplicate(last.index));
                }
            }

            let outcome = match entry.kind {
                EntryKind::Command => match codec::decode_command(&entry.data) {
                    Ok(cmd) => apply_command(txn, cmd)?,
                    Err(err) => Outcome::Rejected(err.into()),
                },
                EntryKind::Configuration => {
                    applied.membership = Some(MembershipMark {
                        mark,
                        config: entry.data.clone(),
                    });
                    Outcome::Applied(None)
                }
                EntryKind::NoOp => Outcome::Applied(None),
            };

            applied.last_applied = Some(mark);
            let bytes = codec::encode_record(&applied)?;
            meta.insert(APPLIED_KEY, bytes.as_slice())?;
            Ok(outcome)
        })
    }
}

fn apply_command(txn: &WriteTransaction, cmd: Command) -> Result<Outcome> {
    let mut kv = txn.open_table(KV_TABLE)?;
    let outcome = match cmd {
        Command::Set { key, value } => {
            kv.insert(key.as_slice(), value.as_slice())?;
            Outcome::Applied(Some(value))
        }
        Command::Delete { key } => {
            kv.remove(key.as_slice())?;
            Outcome::Applied(None)
        }
        Command::Get { key } => {
            let value = kv.get(key.as_slice())?.map(|v| v.value().to_vec());
            match value {
                Some(value) => Outcome::Applied(Some(value)),
                None => Outcome::Rejected(ApplyError::NotFound),
            }
        }
    };
    Ok(outcome)
}

fn load_applied(meta: &impl ReadableTable<&'static [u8], &'static [u8]>) -> Result<AppliedState> {
    let value = meta.get(APPLIED_KEY)?;
    match value {
        Some(bytes) => codec::decode_record(bytes.value()),
        None => Ok(AppliedState::default()),
    }
}

fn read_applied(txn: &ReadTransaction) -> Result<AppliedState> {
    let meta = txn.open_table(META_TABLE)?;
    load_applied(&meta)
}

impl StateMachine for ArimaFsm {
    type Snapshot = ArimaSnapshot;

    fn apply(&mut self, entry: &LogEntry) -> ApplyResponse {
        if let Err(err) = self.ensure_ready() {
            warn!(index = entry.index, "state machine failed, refusing entry");
            return ApplyResponse::failed(err.into());
        }

        match self.commit_entry(entry) {
            Ok(Outcome::Applied(data)) => {
                debug!(index = entry.index, kind = ?entry.kind, "applied entry");
                match data {
                    Some(data) => ApplyResponse::ok(data),
                    None => ApplyResponse::empty(),
                }
            }
            Ok(Outcome::Rejected(err)) => {
                warn!(index = entry.index, error = %err, "entry applied with error");
                ApplyResponse::failed(err)
            }
            Ok(Outcome::Duplicate(last)) => {
                debug!(index = entry.index, last_applied = last, "entry already applied, skipping");
                ApplyResponse::empty()
            }
            Err(err) => {
                error!(index = entry.index, error = %err, "failed to apply entry");
                ApplyResponse::failed(err.into())
            }
        }
    }

    fn snapshot(&self) -> Result<ArimaSnapshot> {
        self.ensure_ready()?;
        let txn = self.engine.begin_read()?;
        let applied = read_applied(&txn)?;
        debug!(last_applied = applied.last_index(), "snapshot taken");
        Ok(ArimaSnapshot { txn, applied })
    }

    fn restore(&mut self, source: &mut dyn Read) -> Result<()> {
        info!("restoring state machine from snapshot stream");
        match self
            .engine
            .update(|txn| engine::load(txn, &FSM_TABLES, source))
        {
            Ok(records) => {
                self.failed.store(false, Ordering::Release);
                info!(records, "state machine restored");
                Ok(())
            }
            Err(err) => {
                self.failed.store(true, Ordering::Release);
                error!(error = %err, "state machine restore failed");
                Err(err)
            }
        }
    }

    fn applied_state(&self) -> Result<AppliedState> {
        self.engine.view(read_applied)
    }
}

/// Snapshot handle pinning a read transaction of the FSM's engine.
pub struct ArimaSnapshot {
    txn: ReadTransaction,
    applied: AppliedState,
}

impl FsmSnapshot for ArimaSnapshot {
    fn applied(&self) -> &AppliedState {
        &self.applied
    }

    fn persist<S: SnapshotSink>(&self, sink: S) -> Result<S::Closed> {
        info!(last_applied = self.applied.last_index(), "persisting snapshot");
        persist_into(sink, |out| {
            let records = engine::backup(&self.txn, &FSM_TABLES, out)?;
            debug!(records, "snapshot stream written");
            Ok(())
        })
    }

    fn release(self) {
        debug!(last_applied = self.applied.last_index(), "releasing snapshot");
    }
}

/// Read-only view of the FSM's key space.
#[derive(Clone)]
pub struct FsmReader {
    engine: Engine,
    failed: Arc<AtomicBool>,
}

impl FsmReader {
    /// Fails with [`ArimaError::NotFound`] when `key` is absent.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.ensure_ready()?;
        self.engine.view(|txn| {
            let kv = txn.open_table(KV_TABLE)?;
            let value = kv.get(key)?;
            match value {
                Some(bytes) => Ok(bytes.value().to_vec()),
                None => Err(ArimaError::NotFound),
            }
        })
    }

    /// Every key/value pair, in key order.
    pub fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.ensure_ready()?;
        self.engine.view(|txn| {
            let kv = txn.open_table(KV_TABLE)?;
            let mut out = Vec::new();
            for item in kv.iter()? {
                let (key, value) = item?;
                out.push((key.value().to_vec(), value.value().to_vec()));
            }
            Ok(out)
        })
    }

    pub fn applied_state(&self) -> Result<AppliedState> {
        self.engine.view(read_applied)
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(ArimaError::Unavailable(RESTORE_FAILED.into()));
        }
        Ok(())
    }
}
