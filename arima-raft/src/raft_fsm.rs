//! Openraft state machine over a [`StateMachine`] and a [`FileSnapshotStore`].

use std::fs::File;
use std::io::{Cursor, Read, Write};

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine, Snapshot};
use openraft::{
    BasicNode, CommittedLeaderId, Entry, ErrorSubject, ErrorVerb, LogId, Membership, OptionalSend,
    SnapshotMeta, StorageError, StoredMembership,
};
use tracing::{debug, info};

use crate::codec;
use crate::commands::ApplyResponse;
use crate::errors::{ArimaError, Result};
use crate::raft_log::{store_err, to_log_entry};
use crate::snapshot::persist_into;
use crate::snapshot_store::{FileSnapshotStore, SnapshotDescriptor};
use crate::state_machine::{AppliedState, EntryMark, FsmSnapshot, StateMachine};
use crate::typ::TypeConfig;

type NodeId = u64;
type Node = BasicNode;

/// Openraft state machine adapter.
pub struct RaftFsmAdapter<F> {
    fsm: F,
    snapshots: FileSnapshotStore,
}

impl<F: StateMachine> RaftFsmAdapter<F> {
    pub fn new(fsm: F, snapshots: FileSnapshotStore) -> Self {
        Self { fsm, snapshots }
    }
}

impl<F: StateMachine> RaftStateMachine<TypeConfig> for RaftFsmAdapter<F> {
    type SnapshotBuilder = ArimaSnapshotBuilder<F::Snapshot>;

    async fn applied_state(
        &mut self,
    ) -> std::result::Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, Node>), StorageError<NodeId>> {
        let applied = self
            .fsm
            .applied_state()
            .map_err(|e| store_err(ErrorVerb::Read, "read applied state", e))?;
        raft_marks(&applied).map_err(|e| store_err(ErrorVerb::Read, "decode applied state", e))
    }

    async fn apply<I>(&mut self, entries: I) -> std::result::Result<Vec<ApplyResponse>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        let mut responses = Vec::new();
        for entry in entries {
            let record = to_log_entry(&entry).map_err(|e| store_err(ErrorVerb::Write, "encode entry", e))?;
            responses.push(self.fsm.apply(&record));
        }
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        ArimaSnapshotBuilder {
            pending: Some(self.fsm.snapshot()),
            snapshots: self.snapshots.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> std::result::Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, Node>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> std::result::Result<(), StorageError<NodeId>> {
        info!(snapshot = %meta.snapshot_id, last_log_id = ?meta.last_log_id, "installing snapshot");
        let data = snapshot.into_inner();

        self.fsm
            .restore(&mut data.as_slice())
            .map_err(|e| snapshot_err(ErrorVerb::Read, "restore snapshot", e))?;

        let keep = || -> Result<SnapshotDescriptor> {
            let sink = self.snapshots.create(self.fsm.applied_state()?)?;
            persist_into(sink, |out| Ok(out.write_all(&data)?))
        };
        let desc = keep().map_err(|e| snapshot_err(ErrorVerb::Write, "store received snapshot", e))?;
        debug!(snapshot = %desc.id, "received snapshot stored");
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> std::result::Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let latest = self
            .snapshots
            .latest()
            .map_err(|e| snapshot_err(ErrorVerb::Read, "list snapshots", e))?;
        let Some(desc) = latest else {
            return Ok(None);
        };

        let (desc, file) = self
            .snapshots
            .open_snapshot(&desc.id)
            .map_err(|e| snapshot_err(ErrorVerb::Read, "open snapshot", e))?;
        let snapshot = load_snapshot(desc, file).map_err(|e| snapshot_err(ErrorVerb::Read, "read snapshot", e))?;
        Ok(Some(snapshot))
    }
}

/// Builds a snapshot from the state captured when the builder was created.
pub struct ArimaSnapshotBuilder<S> {
    pending: Option<Result<S>>,
    snapshots: FileSnapshotStore,
}

impl<S: FsmSnapshot> ArimaSnapshotBuilder<S> {
    fn build(&mut self) -> Result<Snapshot<TypeConfig>> {
        let snap = self
            .pending
            .take()
            .ok_or_else(|| ArimaError::Unavailable("snapshot already built".into()))??;

        let sink = self.snapshots.create(snap.applied().clone())?;
        let persisted = snap.persist(sink);
        snap.release();
        let desc = persisted?;

        let (desc, file) = self.snapshots.open_snapshot(&desc.id)?;
        load_snapshot(desc, file)
    }
}

impl<S: FsmSnapshot> RaftSnapshotBuilder<TypeConfig> for ArimaSnapshotBuilder<S> {
    async fn build_snapshot(&mut self) -> std::result::Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let snapshot = self
            .build()
            .map_err(|e| snapshot_err(ErrorVerb::Write, "build snapshot", e))?;
        info!(snapshot = %snapshot.meta.snapshot_id, last_log_id = ?snapshot.meta.last_log_id, "snapshot built");
        Ok(snapshot)
    }
}

fn load_snapshot(desc: SnapshotDescriptor, mut file: File) -> Result<Snapshot<TypeConfig>> {
    let mut data = Vec::with_capacity(desc.size as usize);
    file.read_to_end(&mut data)?;
    let (last_log_id, last_membership) = raft_marks(&desc.applied)?;
    Ok(Snapshot {
        meta: SnapshotMeta {
            last_log_id,
            last_membership,
            snapshot_id: desc.id,
        },
        snapshot: Box::new(Cursor::new(data)),
    })
}

fn mark_to_log_id(mark: &EntryMark) -> LogId<NodeId> {
    LogId::new(CommittedLeaderId::new(mark.term, mark.leader_id), mark.index)
}

/// The applied marks as openraft sees them.
fn raft_marks(applied: &AppliedState) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, Node>)> {
    let last_applied = applied.last_applied.as_ref().map(mark_to_log_id);
    let membership = match &applied.membership {
        Some(m) => {
            let config: Membership<NodeId, Node> = codec::decode_meta(&m.config)?;
            StoredMembership::new(Some(mark_to_log_id(&m.mark)), config)
        }
        None => StoredMembership::default(),
    };
    Ok((last_applied, membership))
}

fn snapshot_err(verb: ErrorVerb, context: &str, e: ArimaError) -> StorageError<NodeId> {
    StorageError::from_io_error(
        ErrorSubject::Snapshot(None),
        verb,
        std::io::Error::other(format!("{context}: {e}")),
    )
}
