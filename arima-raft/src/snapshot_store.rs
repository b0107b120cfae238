//! Snapshot files on disk.
//!
//! Each snapshot lives in its own directory under the store root:
//!
//! ```text
//! <root>/<id>/meta.json   SnapshotDescriptor
//! <root>/<id>/state.bin   the state machine's snapshot stream
//! ```
//!
//! A snapshot is written into `<id>.tmp` and renamed into place only when
//! its sink is closed, so readers never observe a partial snapshot.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{ArimaError, Result};
use crate::snapshot::SnapshotSink;
use crate::state_machine::AppliedState;

const META_FILE: &str = "meta.json";
const STATE_FILE: &str = "state.bin";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SnapshotDescriptor {
    pub id: String,
    pub applied: AppliedState,
    /// Size of the state stream in bytes.
    pub size: u64,
    pub created_at_ms: u64,
}

/// Directory of completed snapshots, keeping the newest `retain`.
#[derive(Clone, Debug)]
pub struct FileSnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl FileSnapshotStore {
    /// Open (creating if needed) the store rooted at `dir`. Partial
    /// snapshots left behind by a crash are removed.
    pub fn open(dir: impl Into<PathBuf>, retain: usize) -> Result<Self> {
        if retain == 0 {
            return Err(ArimaError::Config("snapshot retain count must be at least 1".into()));
        }
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let partial = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(TMP_SUFFIX));
            if partial {
                warn!(path = %path.display(), "removing partial snapshot");
                fs::remove_dir_all(&path)?;
            }
        }

        debug!(dir = %dir.display(), retain, "snapshot store opened");
        Ok(Self { dir, retain })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Begin a new snapshot of state applied up to `applied`.
    pub fn create(&self, applied: AppliedState) -> Result<FileSnapshotSink> {
        let created_at_ms = now_ms()?;
        let (term, index) = applied
            .last_applied
            .map(|m| (m.term, m.index))
            .unwrap_or((0, 0));
        let id = format!("snap-{term}-{index}-{created_at_ms}");

        let tmp = self.dir.join(format!("{id}{TMP_SUFFIX}"));
        fs::create_dir_all(&tmp)?;
        let file = File::create(tmp.join(STATE_FILE))?;
        debug!(snapshot = %id, "snapshot sink created");

        Ok(FileSnapshotSink {
            store: self.clone(),
            tmp,
            out: BufWriter::new(file),
            descriptor: SnapshotDescriptor {
                id,
                applied,
                size: 0,
                created_at_ms,
            },
        })
    }

    /// Completed snapshots, newest first.
    pub fn list(&self) -> Result<Vec<SnapshotDescriptor>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(TMP_SUFFIX) || !entry.file_type()?.is_dir() {
                continue;
            }
            match read_descriptor(&entry.path()) {
                Ok(desc) => found.push(desc),
                Err(err) => warn!(snapshot = name, error = %err, "skipping unreadable snapshot"),
            }
        }
        found.sort_by(|a, b| {
            let key = |d: &SnapshotDescriptor| (d.applied.last_index(), d.created_at_ms);
            key(b).cmp(&key(a))
        });
        Ok(found)
    }

    pub fn latest(&self) -> Result<Option<SnapshotDescriptor>> {
        Ok(self.list()?.into_iter().next())
    }

    /// Open a completed snapshot for reading its state stream.
    pub fn open_snapshot(&self, id: &str) -> Result<(SnapshotDescriptor, File)> {
        let path = self.dir.join(id);
        let desc = read_descriptor(&path).map_err(|err| match err {
            ArimaError::Io(e) if e.kind() == io::ErrorKind::NotFound => ArimaError::NotFound,
            other => other,
        })?;
        let file = File::open(path.join(STATE_FILE))?;
        Ok((desc, file))
    }

    fn reap(&self) -> Result<()> {
        for stale in self.list()?.into_iter().skip(self.retain) {
            info!(snapshot = %stale.id, "removing old snapshot");
            fs::remove_dir_all(self.dir.join(&stale.id))?;
        }
        Ok(())
    }
}

/// A snapshot being written. Nothing is visible in the store until
/// [`SnapshotSink::close`].
pub struct FileSnapshotSink {
    store: FileSnapshotStore,
    tmp: PathBuf,
    out: BufWriter<File>,
    descriptor: SnapshotDescriptor,
}

impl Write for FileSnapshotSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = self.out.write(data)?;
        self.descriptor.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

impl SnapshotSink for FileSnapshotSink {
    type Closed = SnapshotDescriptor;

    fn id(&self) -> &str {
        &self.descriptor.id
    }

    fn close(self) -> Result<SnapshotDescriptor> {
        let FileSnapshotSink {
            store,
            tmp,
            out,
            descriptor,
        } = self;

        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        fs::write(tmp.join(META_FILE), serde_json::to_vec_pretty(&descriptor)?)?;
        fs::rename(&tmp, store.dir.join(&descriptor.id))?;

        info!(
            snapshot = %descriptor.id,
            size = descriptor.size,
            last_applied = descriptor.applied.last_index(),
            "snapshot completed"
        );
        store.reap()?;
        Ok(descriptor)
    }

    fn cancel(self) -> Result<()> {
        debug!(snapshot = %self.descriptor.id, "snapshot cancelled");
        drop(self.out);
        fs::remove_dir_all(&self.tmp)?;
        Ok(())
    }
}

fn read_descriptor(dir: &Path) -> Result<SnapshotDescriptor> {
    let bytes = fs::read(dir.join(META_FILE))?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn now_ms() -> Result<u64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| ArimaError::Io(io::Error::other(e)))?;
    Ok(elapsed.as_millis() as u64)
}
