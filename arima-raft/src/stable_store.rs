//! Durable key/value storage for small consensus metadata (term, vote,
//! committed and purged marks). Writes go straight through to a committed
//! transaction; there is no buffering.

use redb::TableDefinition;

use crate::codec;
use crate::engine::{BytesTable, Engine};
use crate::errors::{ArimaError, Result};

const STABLE_TABLE: BytesTable = TableDefinition::new("raft_stable");

pub trait StableStore: Send + Sync {
    /// Fails with [`ArimaError::NotFound`] when `key` was never set.
    fn get(&self, key: &[u8]) -> Result<Vec<u8>>;

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn set_u64(&self, key: &[u8], value: u64) -> Result<()> {
        self.set(key, &codec::u64_to_key(value))
    }

    /// Fails with [`ArimaError::NotFound`] when `key` was never set; callers
    /// wanting zero-by-default use [`StableStore::get_u64_or_default`].
    fn get_u64(&self, key: &[u8]) -> Result<u64> {
        codec::key_to_u64(&self.get(key)?)
    }

    fn get_u64_or_default(&self, key: &[u8]) -> Result<u64> {
        match self.get_u64(key) {
            Err(ArimaError::NotFound) => Ok(0),
            other => other,
        }
    }
}

/// [`StableStore`] over a dedicated table of an [`Engine`].
///
/// May share its engine with a `RedbLogStore`; the tables never collide.
#[derive(Clone)]
pub struct RedbStableStore {
    engine: Engine,
}

impl RedbStableStore {
    pub fn new(engine: Engine) -> Result<Self> {
        engine.ensure_table(STABLE_TABLE)?;
        Ok(Self { engine })
    }
}

impl StableStore for RedbStableStore {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.engine.view(|txn| {
            let table = txn.open_table(STABLE_TABLE)?;
            let value = table.get(key)?;
            match value {
                Some(bytes) => Ok(bytes.value().to_vec()),
                None => Err(ArimaError::NotFound),
            }
        })
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.engine.update(|txn| {
            txn.open_table(STABLE_TABLE)?.insert(key, value)?;
            Ok(())
        })
    }
}
