use super::{BoxError, LOG_TABLE, META_TABLE, io_error};
use crate::types::{NodeId, TypeConfig};

use std::fmt::Debug;
use std::ops::RangeBounds;
use std::sync::Arc;

use openraft::storage::{LogFlushed, LogState, RaftLogReader, RaftLogStorage};
use openraft::{Entry, ErrorSubject, ErrorVerb, LogId, OptionalSend, StorageError, Vote};
use redb::{Database, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

const VOTE_KEY: &str = "vote";
const COMMITTED_KEY: &str = "committed";
const LAST_PURGED_KEY: &str = "last_purged";

/// Raft log, vote and commit index persisted in `redb`.
#[derive(Clone)]
pub struct LogStore {
    db: Arc<Database>,
}

impl LogStore {
    /// Creates a log store over an opened database.
    pub const fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn read_meta<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, BoxError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META_TABLE)?;
        let value = table.get(key)?;

        Ok(value
            .map(|value| serde_json::from_slice(value.value()))
            .transpose()?)
    }

    fn write_meta<T: Serialize>(&self, key: &str, value: Option<&T>) -> Result<(), BoxError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(META_TABLE)?;
            if let Some(value) = value {
                let bytes = serde_json::to_vec(value)?;
                table.insert(key, bytes.as_slice())?;
            } else {
                table.remove(key)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn log_state(&self) -> Result<LogState<TypeConfig>, BoxError> {
        let last_purged: Option<LogId<NodeId>> = self.read_meta(LAST_PURGED_KEY)?;

        let txn = self.db.begin_read()?;
        let table = txn.open_table(LOG_TABLE)?;
        let last_log_id = match table.last()? {
            Some((_, value)) => Some(serde_json::from_slice::<Entry<TypeConfig>>(value.value())?.log_id),
            None => None,
        };

        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id: last_log_id.or(last_purged),
        })
    }

    fn entries<RB: RangeBounds<u64>>(&self, range: RB) -> Result<Vec<Entry<TypeConfig>>, BoxError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LOG_TABLE)?;

        let mut entries = Vec::new();
        for item in table.range(range)? {
            let (_, value) = item?;
            entries.push(serde_json::from_slice(value.value())?);
        }

        Ok(entries)
    }

    fn insert_entries<I>(&self, entries: I) -> Result<(), BoxError>
    where
        I: IntoIterator<Item = Entry<TypeConfig>>,
    {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(LOG_TABLE)?;
            for entry in entries {
                let bytes = serde_json::to_vec(&entry)?;
                table.insert(entry.log_id.index, bytes.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn remove_entries<RB: RangeBounds<u64>>(&self, range: RB) -> Result<(), BoxError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(LOG_TABLE)?;
            let indexes = table
                .range(range)?
                .map(|item| item.map(|(index, _)| index.value()))
                .collect::<Result<Vec<u64>, _>>()?;

            for index in indexes {
                table.remove(index)?;
            }
        }
        txn.commit()?;
        Ok(())
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        self.entries(range)
            .map_err(io_error(ErrorSubject::Logs, ErrorVerb::Read))
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        self.log_state()
            .map_err(io_error(ErrorSubject::Logs, ErrorVerb::Read))
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.write_meta(VOTE_KEY, Some(vote))
            .map_err(io_error(ErrorSubject::Vote, ErrorVerb::Write))
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        self.read_meta(VOTE_KEY)
            .map_err(io_error(ErrorSubject::Vote, ErrorVerb::Read))
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.write_meta(COMMITTED_KEY, committed.as_ref())
            .map_err(io_error(ErrorSubject::Store, ErrorVerb::Write))
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        self.read_meta(COMMITTED_KEY)
            .map_err(io_error(ErrorSubject::Store, ErrorVerb::Read))
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        self.insert_entries(entries)
            .map_err(io_error(ErrorSubject::Logs, ErrorVerb::Write))?;

        // redb commits are durable, so the entries are flushed at this point.
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        debug!("truncating log from {}", log_id.index);

        self.remove_entries(log_id.index..)
            .map_err(io_error(ErrorSubject::Log(log_id), ErrorVerb::Delete))
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        debug!("purging log up to {}", log_id.index);

        self.write_meta(LAST_PURGED_KEY, Some(&log_id))
            .and_then(|()| self.remove_entries(..=log_id.index))
            .map_err(io_error(ErrorSubject::Log(log_id), ErrorVerb::Delete))
    }
}
