//! Raft state machine: the replicated lock table.
//!
//! Every committed log entry is decoded and applied here, in log order, on
//! every replica. [`LockTable::apply`] is a pure function of the current table
//! and the payload: no clock, no randomness, no node identity. Replicas that
//! apply the same entries therefore hold identical tables.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine, Snapshot};
use openraft::{
    Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, OptionalSend, SnapshotMeta,
    StorageError, StoredMembership,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use crate::commands::{CommandKind, LockCommand, LockResponse};
use crate::errors::SnapshotError;
use crate::snapshot_store::FileSnapshotStore;
use crate::typ::{Node, NodeId, TypeConfig};

/// Lock state of a single key. A key missing from the table is free.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct LockRecord {
    pub held: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Lease deadline (ms since the Unix epoch). `None` never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
}

impl LockRecord {
    fn lease_expired(&self, now_ms: u64) -> bool {
        self.held && self.expires_at_ms.is_some_and(|deadline| deadline <= now_ms)
    }
}

/// Mapping from object key to lock state.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct LockTable {
    entries: BTreeMap<String, LockRecord>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.entries.get(key).map(|r| r.held).unwrap_or(false)
    }

    /// Current holder of `key`, if held.
    pub fn holder(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .filter(|r| r.held)
            .and_then(|r| r.owner.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &LockRecord)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(key, owner)` of every held key whose lease ended at or before `now_ms`.
    pub fn expired(&self, now_ms: u64) -> Vec<(String, String)> {
        self.entries
            .iter()
            .filter(|(_, r)| r.lease_expired(now_ms))
            .map(|(key, r)| (key.clone(), r.owner.clone().unwrap_or_default()))
            .collect()
    }

    /// Decode and apply one log payload.
    ///
    /// A payload that does not decode is logged and dropped; the table is
    /// left unchanged.
    pub fn apply(&mut self, payload: &[u8]) -> LockResponse {
        match LockCommand::decode(payload) {
            Ok(cmd) => self.apply_command(&cmd),
            Err(e) => {
                warn!(error = %e, len = payload.len(), "dropping undecodable lock command");
                LockResponse::Dropped
            }
        }
    }

    /// Apply a decoded command.
    ///
    /// - `Lock` grants the key when it is free, already held by the same
    ///   owner (renewing the lease) or held under a lease that ended before
    ///   the command's `now_ms`. Otherwise it reports the current holder.
    /// - `Unlock` frees the key when the caller holds it or when it is
    ///   already free, and reports the holder otherwise.
    /// - `Expire` frees the key only if `owner` still holds it and its lease
    ///   ended before the command's `now_ms`.
    pub fn apply_command(&mut self, cmd: &LockCommand) -> LockResponse {
        let current = self.entries.get(&cmd.key);
        let held_by_other = current
            .filter(|r| r.held)
            .and_then(|r| r.owner.as_deref())
            .filter(|owner| *owner != cmd.owner)
            .map(str::to_owned);
        let lease_expired = current.is_some_and(|r| r.lease_expired(cmd.now_ms));

        match (cmd.kind, held_by_other) {
            (CommandKind::Lock, Some(owner)) if !lease_expired => LockResponse::Held { owner },
            (CommandKind::Lock, previous) => {
                if let Some(previous) = previous {
                    info!(
                        key = %cmd.key,
                        %previous,
                        owner = %cmd.owner,
                        "lease expired, lock taken over"
                    );
                }
                self.entries.insert(
                    cmd.key.clone(),
                    LockRecord {
                        held: true,
                        owner: Some(cmd.owner.clone()),
                        expires_at_ms: cmd.expires_at_ms,
                    },
                );
                LockResponse::Granted
            }
            (CommandKind::Unlock, Some(owner)) => LockResponse::NotOwner { owner },
            (CommandKind::Unlock, None) => {
                self.entries.insert(cmd.key.clone(), LockRecord::default());
                LockResponse::Released
            }
            (CommandKind::Expire, None) if lease_expired => {
                info!(key = %cmd.key, owner = %cmd.owner, "lock lease expired");
                self.entries.insert(cmd.key.clone(), LockRecord::default());
                LockResponse::Released
            }
            (CommandKind::Expire, _) => LockResponse::Noop,
        }
    }
}

/// Point-in-time copy of the state machine, serialized as JSON.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct LockSnapshot {
    pub last_applied_log: Option<LogId<NodeId>>,
    pub last_membership: StoredMembership<NodeId, Node>,
    pub table: LockTable,
}

impl LockSnapshot {
    pub fn snapshot_id(&self) -> String {
        match self.last_applied_log {
            Some(last) => format!("snap-{}-{}", last.leader_id, last.index),
            None => "snap-empty".to_string(),
        }
    }

    pub fn meta(&self) -> SnapshotMeta<NodeId, Node> {
        SnapshotMeta {
            last_log_id: self.last_applied_log,
            last_membership: self.last_membership.clone(),
            snapshot_id: self.snapshot_id(),
        }
    }

    /// Write the snapshot to `sink`.
    pub fn serialize_to<W: Write>(&self, sink: W) -> Result<(), SnapshotError> {
        serde_json::to_writer(sink, self)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        let mut buf = Vec::new();
        self.serialize_to(&mut buf)?;
        Ok(buf)
    }

    /// Read a full snapshot from `source`. Truncated or invalid input is an error.
    pub fn read_from<R: Read>(source: R) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_reader(source)?)
    }
}

/// State shared between the state machine (owned by Raft) and its clones.
struct StateMachineData {
    table: LockTable,
    last_applied_log: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, Node>,
}

impl StateMachineData {
    fn snapshot(&self) -> LockSnapshot {
        LockSnapshot {
            last_applied_log: self.last_applied_log,
            last_membership: self.last_membership.clone(),
            table: self.table.clone(),
        }
    }

    fn install(&mut self, snap: LockSnapshot) {
        self.last_applied_log = snap.last_applied_log;
        self.last_membership = snap.last_membership;
        self.table = snap.table;
    }
}

type SharedStateMachineData = Arc<RwLock<StateMachineData>>;

/// The replicated lock state machine.
///
/// Clones share the same table. The table is only written through
/// [`RaftStateMachine::apply`] and snapshot installation; readers get copies.
#[derive(Clone)]
pub struct LockStateMachine {
    data: SharedStateMachineData,
    releases: Arc<Notify>,
    snapshots: Option<Arc<FileSnapshotStore>>,
}

impl Default for LockStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LockStateMachine {
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(StateMachineData {
                table: LockTable::new(),
                last_applied_log: None,
                last_membership: StoredMembership::default(),
            })),
            releases: Arc::new(Notify::new()),
            snapshots: None,
        }
    }

    /// Persist built and installed snapshots into `store`.
    pub fn with_snapshot_store(mut self, store: Arc<FileSnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// Notified every time an applied `Unlock` frees a key.
    pub fn releases(&self) -> Arc<Notify> {
        self.releases.clone()
    }

    /// Copy of the current table.
    pub async fn lock_table(&self) -> LockTable {
        self.data.read().await.table.clone()
    }

    /// Deep copy of the current state. Later applies do not affect it.
    pub async fn snapshot(&self) -> LockSnapshot {
        self.data.read().await.snapshot()
    }

    /// Replace the whole state with the snapshot read from `source`.
    ///
    /// The current state is left untouched if the source does not decode.
    pub async fn restore<R: Read>(&self, source: R) -> Result<(), SnapshotError> {
        let snap = LockSnapshot::read_from(source)?;
        self.restore_snapshot(snap).await;
        Ok(())
    }

    /// Replace the whole state with an already decoded snapshot.
    pub async fn restore_snapshot(&self, snap: LockSnapshot) {
        let keys = snap.table.len();
        let last_applied = snap.last_applied_log;
        self.data.write().await.install(snap);
        info!(keys, ?last_applied, "lock table restored from snapshot");
    }

    async fn build(&self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let snap = self.snapshot().await;
        let bytes = snap
            .to_bytes()
            .map_err(|e| snapshot_err(e, ErrorVerb::Write))?;
        if let Some(store) = &self.snapshots {
            store
                .save(&snap)
                .map_err(|e| snapshot_err(e, ErrorVerb::Write))?;
        }
        debug!(snapshot_id = %snap.snapshot_id(), keys = snap.table.len(), "built snapshot");
        Ok(Snapshot {
            meta: snap.meta(),
            snapshot: Box::new(Cursor::new(bytes)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for LockStateMachine {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, Node>), StorageError<NodeId>> {
        let d = self.data.read().await;
        Ok((d.last_applied_log, d.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<LockResponse>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        let mut d = self.data.write().await;
        let mut responses = Vec::new();
        let mut released = false;

        for entry in entries {
            d.last_applied_log = Some(entry.log_id);

            let resp = match entry.payload {
                EntryPayload::Blank => LockResponse::Noop,
                EntryPayload::Normal(cmd) => {
                    let resp = d.table.apply(cmd.as_bytes());
                    debug!(log_id = %entry.log_id, ?resp, "applied lock command");
                    released |= resp == LockResponse::Released;
                    resp
                }
                EntryPayload::Membership(mem) => {
                    d.last_membership = StoredMembership::new(Some(entry.log_id), mem);
                    LockResponse::Noop
                }
            };
            responses.push(resp);
        }
        drop(d);

        if released {
            self.releases.notify_waiters();
        }
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, Node>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let mut snap = LockSnapshot::read_from(Cursor::new(snapshot.into_inner()))
            .map_err(|e| snapshot_err(e, ErrorVerb::Read))?;
        snap.last_applied_log = meta.last_log_id;
        snap.last_membership = meta.last_membership.clone();

        if let Some(store) = &self.snapshots {
            store
                .save(&snap)
                .map_err(|e| snapshot_err(e, ErrorVerb::Write))?;
        }

        info!(snapshot_id = %meta.snapshot_id, keys = snap.table.len(), "installing snapshot");
        self.data.write().await.install(snap);
        // Keys may have been freed by the installed state.
        self.releases.notify_waiters();
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let snap = match &self.snapshots {
            Some(store) => store
                .latest()
                .map_err(|e| snapshot_err(e, ErrorVerb::Read))?,
            None => {
                let snap = self.snapshot().await;
                snap.last_applied_log.map(|_| snap)
            }
        };

        let Some(snap) = snap else {
            return Ok(None);
        };
        let bytes = snap
            .to_bytes()
            .map_err(|e| snapshot_err(e, ErrorVerb::Read))?;
        Ok(Some(Snapshot {
            meta: snap.meta(),
            snapshot: Box::new(Cursor::new(bytes)),
        }))
    }
}

impl RaftSnapshotBuilder<TypeConfig> for LockStateMachine {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        self.build().await
    }
}

fn snapshot_err(e: SnapshotError, verb: ErrorVerb) -> StorageError<NodeId> {
    StorageError::from_io_error(
        ErrorSubject::Snapshot(None),
        verb,
        std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
    )
}
