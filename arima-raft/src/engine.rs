//! Embedded storage engine handle backed by `redb`.
//!
//! Every logical operation in the stores and the state machine runs inside
//! exactly one scoped transaction: [`Engine::view`] for reads and
//! [`Engine::update`] for writes. `update` commits only when the closure
//! succeeds; any error aborts the transaction before it is returned.
//!
//! The module also owns the engine's full-backup stream, used by state
//! machine snapshots:
//!
//! ```text
//! "ARIMABK1"
//! { tag:u8 | key_len:u32 BE | key | val_len:u32 BE | val }*
//! 0xFF | record_count:u64 BE
//! ```

use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::Arc;

use redb::{Database, Durability, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use tracing::{debug, warn};

use crate::errors::{ArimaError, Result};

/// All tables are byte-keyed; ordering is defined by the key encoding.
pub type BytesTable = TableDefinition<'static, &'static [u8], &'static [u8]>;

const STREAM_MAGIC: &[u8; 8] = b"ARIMABK1";
const FRAME_END: u8 = 0xFF;
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Shared, cloneable handle to one redb database file.
#[derive(Clone)]
pub struct Engine {
    db: Arc<Database>,
    sync_writes: bool,
}

impl Engine {
    /// Open or create the database at `path`.
    ///
    /// With `sync_writes = false` commits use eventual durability: they are
    /// atomic but may be lost on power failure until a later durable commit.
    pub fn open(path: impl AsRef<Path>, sync_writes: bool) -> Result<Self> {
        let path = path.as_ref();
        let db = Database::create(path)?;
        debug!(path = %path.display(), sync_writes, "storage engine opened");
        Ok(Self {
            db: Arc::new(db),
            sync_writes,
        })
    }

    /// Whether commits are flushed to disk before they return.
    pub fn is_durable(&self) -> bool {
        self.sync_writes
    }

    /// Create `table` if it does not exist yet.
    pub fn ensure_table(&self, table: BytesTable) -> Result<()> {
        self.update(|txn| {
            txn.open_table(table)?;
            Ok(())
        })
    }

    /// Run `f` inside a read transaction.
    pub fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ReadTransaction) -> Result<T>,
    {
        let txn = self.db.begin_read()?;
        f(&txn)
    }

    /// Run `f` inside a write transaction, committing on `Ok` and aborting on `Err`.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&WriteTransaction) -> Result<T>,
    {
        let mut txn = self.db.begin_write()?;
        if !self.sync_writes {
            txn.set_durability(Durability::Eventual);
        }
        match f(&txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(abort_err) = txn.abort() {
                    warn!(error = %abort_err, "failed to abort write transaction");
                }
                Err(err)
            }
        }
    }

    /// Start a read transaction that outlives a single call. Its view stays
    /// fixed while later write transactions commit.
    pub fn begin_read(&self) -> Result<ReadTransaction> {
        Ok(self.db.begin_read()?)
    }
}

/// Write every record of `tables`, as seen by `txn`, to `out`.
/// Returns the number of records written.
pub fn backup(txn: &ReadTransaction, tables: &[BytesTable], out: &mut dyn Write) -> Result<u64> {
    out.write_all(STREAM_MAGIC)?;
    let mut records = 0u64;
    for (tag, def) in tables.iter().enumerate() {
        let table = txn.open_table(*def)?;
        for item in table.iter()? {
            let (key, value) = item?;
            write_frame(out, tag as u8, key.value(), value.value())?;
            records += 1;
        }
    }
    out.write_all(&[FRAME_END])?;
    out.write_all(&records.to_be_bytes())?;
    out.flush()?;
    Ok(records)
}

/// Replace the contents of `tables` with the records read from `input`.
///
/// Runs inside the caller's write transaction; if this returns an error the
/// caller must not commit.
pub fn load(txn: &WriteTransaction, tables: &[BytesTable], input: &mut dyn Read) -> Result<u64> {
    let mut magic = [0u8; 8];
    read_exact_or_corrupt(input, &mut magic, "stream header")?;
    if &magic != STREAM_MAGIC {
        return Err(ArimaError::CorruptSnapshot("unrecognised stream header".into()));
    }

    for def in tables {
        txn.delete_table(*def)?;
    }
    let mut opened = Vec::with_capacity(tables.len());
    for def in tables {
        opened.push(txn.open_table(*def)?);
    }

    let mut records = 0u64;
    loop {
        let mut tag = [0u8; 1];
        read_exact_or_corrupt(input, &mut tag, "frame tag")?;
        if tag[0] == FRAME_END {
            let mut count = [0u8; 8];
            read_exact_or_corrupt(input, &mut count, "record count")?;
            let expected = u64::from_be_bytes(count);
            if expected != records {
                return Err(ArimaError::CorruptSnapshot(format!(
                    "stream announced {expected} records, found {records}"
                )));
            }
            return Ok(records);
        }

        let table = opened.get_mut(tag[0] as usize).ok_or_else(|| {
            ArimaError::CorruptSnapshot(format!("unknown table tag {}", tag[0]))
        })?;
        let key = read_chunk(input)?;
        let value = read_chunk(input)?;
        table.insert(key.as_slice(), value.as_slice())?;
        records += 1;
    }
}

fn write_frame(out: &mut dyn Write, tag: u8, key: &[u8], value: &[u8]) -> Result<()> {
    out.write_all(&[tag])?;
    for chunk in [key, value] {
        let len = u32::try_from(chunk.len())
            .map_err(|_| ArimaError::Encoding(format!("record of {} bytes", chunk.len())))?;
        out.write_all(&len.to_be_bytes())?;
        out.write_all(chunk)?;
    }
    Ok(())
}

fn read_chunk(input: &mut dyn Read) -> Result<Vec<u8>> {
    let mut len = [0u8; 4];
    read_exact_or_corrupt(input, &mut len, "frame length")?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ArimaError::CorruptSnapshot(format!("frame of {len} bytes")));
    }
    let mut buf = vec![0u8; len];
    read_exact_or_corrupt(input, &mut buf, "frame body")?;
    Ok(buf)
}

fn read_exact_or_corrupt(input: &mut dyn Read, buf: &mut [u8], what: &str) -> Result<()> {
    input.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => ArimaError::CorruptSnapshot(format!("truncated {what}")),
        _ => ArimaError::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LEFT: BytesTable = TableDefinition::new("left");
    const RIGHT: BytesTable = TableDefinition::new("right");

    fn engine(dir: &TempDir, name: &str) -> Engine {
        let engine = Engine::open(dir.path().join(name), true).unwrap();
        engine.ensure_table(LEFT).unwrap();
        engine.ensure_table(RIGHT).unwrap();
        engine
    }

    fn put(engine: &Engine, def: BytesTable, key: &[u8], value: &[u8]) {
        engine
            .update(|txn| {
                txn.open_table(def)?.insert(key, value)?;
                Ok(())
            })
            .unwrap();
    }

    fn dump(engine: &Engine, def: BytesTable) -> Vec<(Vec<u8>, Vec<u8>)> {
        engine
            .view(|txn| {
                let table = txn.open_table(def)?;
                let mut out = Vec::new();
                for item in table.iter()? {
                    let (k, v) = item?;
                    out.push((k.value().to_vec(), v.value().to_vec()));
                }
                Ok(out)
            })
            .unwrap()
    }

    #[test]
    fn failed_update_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, "db.redb");

        let res: Result<()> = engine.update(|txn| {
            txn.open_table(LEFT)?.insert(b"k".as_slice(), b"v".as_slice())?;
            Err(ArimaError::NotFound)
        });

        assert!(res.is_err());
        assert!(dump(&engine, LEFT).is_empty());
    }

    #[test]
    fn backup_is_point_in_time_and_loads_into_fresh_engine() {
        let dir = TempDir::new().unwrap();
        let source = engine(&dir, "source.redb");
        put(&source, LEFT, b"a", b"1");
        put(&source, RIGHT, b"meta", b"x");

        let txn = source.begin_read().unwrap();
        put(&source, LEFT, b"b", b"2");

        let mut stream = Vec::new();
        let written = backup(&txn, &[LEFT, RIGHT], &mut stream).unwrap();
        drop(txn);
        assert_eq!(written, 2);

        let target = engine(&dir, "target.redb");
        put(&target, LEFT, b"stale", b"gone");
        let loaded = target
            .update(|txn| load(txn, &[LEFT, RIGHT], &mut stream.as_slice()))
            .unwrap();

        assert_eq!(loaded, 2);
        assert_eq!(dump(&target, LEFT), vec![(b"a".to_vec(), b"1".to_vec())]);
        assert_eq!(dump(&target, RIGHT), vec![(b"meta".to_vec(), b"x".to_vec())]);
    }

    #[test]
    fn truncated_stream_is_corrupt_and_leaves_target_untouched() {
        let dir = TempDir::new().unwrap();
        let source = engine(&dir, "source.redb");
        put(&source, LEFT, b"a", b"1");
        put(&source, LEFT, b"b", b"2");

        let mut stream = Vec::new();
        let txn = source.begin_read().unwrap();
        backup(&txn, &[LEFT, RIGHT], &mut stream).unwrap();
        stream.truncate(stream.len() - 12);

        let target = engine(&dir, "target.redb");
        put(&target, LEFT, b"keep", b"me");
        let err = target
            .update(|txn| load(txn, &[LEFT, RIGHT], &mut stream.as_slice()))
            .unwrap_err();

        assert!(matches!(err, ArimaError::CorruptSnapshot(_)));
        assert_eq!(dump(&target, LEFT), vec![(b"keep".to_vec(), b"me".to_vec())]);
    }

    #[test]
    fn foreign_stream_is_rejected() {
        let dir = TempDir::new().unwrap();
        let target = engine(&dir, "target.redb");
        let err = target
            .update(|txn| load(txn, &[LEFT], &mut b"NOTASNAPSHOT".as_slice()))
            .unwrap_err();
        assert!(matches!(err, ArimaError::CorruptSnapshot(_)));
    }
}
