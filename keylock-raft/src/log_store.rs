//! Durable Raft log backed by `redb`.
//!
//! Log entries live in one table keyed by index; the vote, the committed log
//! id and the last purged log id live in a small meta table. Every mutation
//! is committed before openraft is told the IO completed.

use std::fmt::Debug;
use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Arc;

use openraft::storage::{LogFlushed, LogState, RaftLogReader, RaftLogStorage};
use openraft::{Entry, ErrorSubject, ErrorVerb, LogId, OptionalSend, StorageError, Vote};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::typ::{NodeId, TypeConfig};

const ENTRIES: TableDefinition<u64, &[u8]> = TableDefinition::new("lock_log");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("lock_log_meta");

const VOTE_KEY: &str = "vote";
const COMMITTED_KEY: &str = "committed";
const PURGED_KEY: &str = "last_purged";

type StoreResult<T> = Result<T, StorageError<NodeId>>;

/// Raft log store. Clones share the same database.
#[derive(Clone)]
pub struct RedbLogStore {
    db: Arc<Database>,
}

impl RedbLogStore {
    /// Open or create the log database at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db = Database::create(path).map_err(|e| store_err(e, ErrorVerb::Write, "open"))?;

        let txn = db
            .begin_write()
            .map_err(|e| store_err(e, ErrorVerb::Write, "begin init"))?;
        {
            txn.open_table(ENTRIES)
                .map_err(|e| store_err(e, ErrorVerb::Write, "create entries table"))?;
            txn.open_table(META)
                .map_err(|e| store_err(e, ErrorVerb::Write, "create meta table"))?;
        }
        txn.commit()
            .map_err(|e| store_err(e, ErrorVerb::Write, "commit init"))?;

        Ok(Self { db: Arc::new(db) })
    }

    fn get_meta<T: serde::de::DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| store_err(e, ErrorVerb::Read, "begin read"))?;
        let table = txn
            .open_table(META)
            .map_err(|e| store_err(e, ErrorVerb::Read, "open meta table"))?;
        let Some(raw) = table
            .get(key)
            .map_err(|e| store_err(e, ErrorVerb::Read, key))?
        else {
            return Ok(None);
        };
        let value =
            bincode::deserialize(raw.value()).map_err(|e| store_err(e, ErrorVerb::Read, key))?;
        Ok(Some(value))
    }

    fn put_meta<T: serde::Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        let bytes = bincode::serialize(value).map_err(|e| store_err(e, ErrorVerb::Write, key))?;
        let txn = self
            .db
            .begin_write()
            .map_err(|e| store_err(e, ErrorVerb::Write, "begin write"))?;
        {
            let mut table = txn
                .open_table(META)
                .map_err(|e| store_err(e, ErrorVerb::Write, "open meta table"))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(|e| store_err(e, ErrorVerb::Write, key))?;
        }
        txn.commit()
            .map_err(|e| store_err(e, ErrorVerb::Write, "commit meta"))
    }

    /// Remove every entry whose index falls in `range`, optionally recording
    /// `purged` as the last purged log id in the same transaction.
    fn remove_range(
        &self,
        range: impl RangeBounds<u64>,
        purged: Option<&LogId<NodeId>>,
    ) -> StoreResult<()> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| store_err(e, ErrorVerb::Delete, "begin write"))?;
        {
            let mut table = txn
                .open_table(ENTRIES)
                .map_err(|e| store_err(e, ErrorVerb::Delete, "open entries table"))?;
            let doomed = table
                .range(range)
                .map_err(|e| store_err(e, ErrorVerb::Delete, "range"))?
                .map(|item| item.map(|(k, _)| k.value()))
                .collect::<Result<Vec<u64>, _>>()
                .map_err(|e| store_err(e, ErrorVerb::Delete, "collect range"))?;
            for index in doomed {
                table
                    .remove(index)
                    .map_err(|e| store_err(e, ErrorVerb::Delete, "remove entry"))?;
            }

            if let Some(log_id) = purged {
                let bytes = bincode::serialize(log_id)
                    .map_err(|e| store_err(e, ErrorVerb::Write, PURGED_KEY))?;
                let mut meta = txn
                    .open_table(META)
                    .map_err(|e| store_err(e, ErrorVerb::Write, "open meta table"))?;
                meta.insert(PURGED_KEY, bytes.as_slice())
                    .map_err(|e| store_err(e, ErrorVerb::Write, PURGED_KEY))?;
            }
        }
        txn.commit()
            .map_err(|e| store_err(e, ErrorVerb::Delete, "commit removal"))
    }
}

impl RaftLogReader<TypeConfig> for RedbLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> StoreResult<Vec<Entry<TypeConfig>>> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| store_err(e, ErrorVerb::Read, "begin read"))?;
        let table = txn
            .open_table(ENTRIES)
            .map_err(|e| store_err(e, ErrorVerb::Read, "open entries table"))?;

        let mut entries = Vec::new();
        for item in table
            .range(range)
            .map_err(|e| store_err(e, ErrorVerb::Read, "range"))?
        {
            let (_, raw) = item.map_err(|e| store_err(e, ErrorVerb::Read, "iterate"))?;
            let entry = serde_json::from_slice(raw.value())
                .map_err(|e| store_err(e, ErrorVerb::Read, "decode entry"))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for RedbLogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> StoreResult<LogState<TypeConfig>> {
        let last_purged: Option<LogId<NodeId>> = self.get_meta(PURGED_KEY)?;

        let txn = self
            .db
            .begin_read()
            .map_err(|e| store_err(e, ErrorVerb::Read, "begin read"))?;
        let table = txn
            .open_table(ENTRIES)
            .map_err(|e| store_err(e, ErrorVerb::Read, "open entries table"))?;
        let last = table
            .last()
            .map_err(|e| store_err(e, ErrorVerb::Read, "last entry"))?;

        let last_log_id = match last {
            Some((_, raw)) => {
                let entry: Entry<TypeConfig> = serde_json::from_slice(raw.value())
                    .map_err(|e| store_err(e, ErrorVerb::Read, "decode last entry"))?;
                Some(entry.log_id)
            }
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

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> StoreResult<()> {
        self.put_meta(VOTE_KEY, vote)?;
        debug!(?vote, "vote saved");
        Ok(())
    }

    async fn read_vote(&mut self) -> StoreResult<Option<Vote<NodeId>>> {
        self.get_meta(VOTE_KEY)
    }

    async fn save_committed(&mut self, committed: Option<LogId<NodeId>>) -> StoreResult<()> {
        match committed {
            Some(log_id) => self.put_meta(COMMITTED_KEY, &log_id),
            None => Ok(()),
        }
    }

    async fn read_committed(&mut self) -> StoreResult<Option<LogId<NodeId>>> {
        self.get_meta(COMMITTED_KEY)
    }

    async fn append<I>(&mut self, entries: I, callback: LogFlushed<TypeConfig>) -> StoreResult<()>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| store_err(e, ErrorVerb::Write, "begin append"))?;
        {
            let mut table = txn
                .open_table(ENTRIES)
                .map_err(|e| store_err(e, ErrorVerb::Write, "open entries table"))?;
            for entry in entries {
                let raw = serde_json::to_vec(&entry)
                    .map_err(|e| store_err(e, ErrorVerb::Write, "encode entry"))?;
                table
                    .insert(entry.log_id.index, raw.as_slice())
                    .map_err(|e| store_err(e, ErrorVerb::Write, "insert entry"))?;
            }
        }
        txn.commit()
            .map_err(|e| store_err(e, ErrorVerb::Write, "commit append"))?;

        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> StoreResult<()> {
        self.remove_range(log_id.index.., None)?;
        debug!(%log_id, "log truncated");
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> StoreResult<()> {
        self.remove_range(..=log_id.index, Some(&log_id))?;
        debug!(%log_id, "log purged");
        Ok(())
    }
}

fn store_err(e: impl std::fmt::Display, verb: ErrorVerb, context: &str) -> StorageError<NodeId> {
    StorageError::from_io_error(
        ErrorSubject::Store,
        verb,
        std::io::Error::new(std::io::ErrorKind::Other, format!("{context}: {e}")),
    )
}
