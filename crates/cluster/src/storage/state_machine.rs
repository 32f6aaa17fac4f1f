use super::{BoxError, SNAPSHOT_TABLE, io_error};
use crate::error::BootstrapError;
use crate::types::{KeyValue, NodeId, Request, Response, TypeConfig, WatchEvent};

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine, Snapshot};
use openraft::{
    BasicNode, Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, OptionalSend, SnapshotMeta,
    StorageError, StoredMembership,
};
use redb::Database;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info};

const CURRENT_SNAPSHOT_KEY: &str = "current";
const WATCH_CAPACITY: usize = 1024;

/// A snapshot as persisted in the database.
#[derive(Serialize, Deserialize)]
struct StoredSnapshot {
    meta: SnapshotMeta<NodeId, BasicNode>,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct StateMachineData {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    kv: BTreeMap<String, KeyValue>,
}

impl StateMachineData {
    fn apply(&mut self, revision: u64, request: Request) -> (Response, Option<WatchEvent>) {
        match request {
            Request::Put { key, value } => {
                let kv = match self.kv.get(&key) {
                    Some(existing) => KeyValue {
                        value,
                        mod_revision: revision,
                        version: existing.version + 1,
                        ..existing.clone()
                    },
                    None => KeyValue {
                        key: key.clone(),
                        value,
                        create_revision: revision,
                        mod_revision: revision,
                        version: 1,
                    },
                };
                self.kv.insert(key, kv.clone());

                (
                    Response {
                        revision,
                        deleted: 0,
                    },
                    Some(WatchEvent::Put { kv }),
                )
            }
            Request::Delete { key } => {
                let removed = self.kv.remove(&key).is_some();
                let event = removed.then(|| WatchEvent::Delete { key, revision });

                (
                    Response {
                        revision,
                        deleted: u64::from(removed),
                    },
                    event,
                )
            }
        }
    }
}

/// In-memory key/value state machine whose snapshots are persisted in `redb`.
///
/// Clones share the same state, so the API servers read from the instance
/// raft applies to.
#[derive(Clone)]
pub struct StateMachineStore {
    data: Arc<RwLock<StateMachineData>>,
    db: Arc<Database>,
    events: broadcast::Sender<WatchEvent>,
    snapshot_counter: Arc<AtomicU64>,
}

impl StateMachineStore {
    /// Opens the state machine, restoring the last persisted snapshot if any.
    ///
    /// Entries after the snapshot are re-applied by raft from the log.
    pub fn open(db: Arc<Database>) -> Result<Self, BootstrapError> {
        let corrupt = |e: BoxError| BootstrapError::CorruptState(e.to_string());

        let data = match read_snapshot(&db).map_err(corrupt)? {
            Some(stored) => {
                let data = restore(&stored.meta, &stored.data).map_err(|e| corrupt(Box::new(e)))?;
                info!(
                    "restored snapshot {} with {} keys",
                    stored.meta.snapshot_id,
                    data.kv.len()
                );
                data
            }
            None => StateMachineData::default(),
        };

        let (events, _) = broadcast::channel(WATCH_CAPACITY);

        Ok(Self {
            data: Arc::new(RwLock::new(data)),
            db,
            events,
            snapshot_counter: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Subscribes to changes applied from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    /// Reads `key`, or every key starting with it when `prefix` is set.
    pub async fn range(&self, key: &str, prefix: bool) -> Vec<KeyValue> {
        let data = self.data.read().await;

        if prefix {
            data.kv
                .range(key.to_string()..)
                .take_while(|(candidate, _)| candidate.starts_with(key))
                .map(|(_, kv)| kv.clone())
                .collect()
        } else {
            data.kv.get(key).cloned().into_iter().collect()
        }
    }

    #[cfg(test)]
    async fn last_applied(&self) -> Option<LogId<NodeId>> {
        self.data.read().await.last_applied
    }

    fn write_snapshot(&self, stored: &StoredSnapshot) -> Result<(), BoxError> {
        let bytes = serde_json::to_vec(stored)?;

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SNAPSHOT_TABLE)?;
            table.insert(CURRENT_SNAPSHOT_KEY, bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }
}

fn read_snapshot(db: &Database) -> Result<Option<StoredSnapshot>, BoxError> {
    let txn = db.begin_read()?;
    let table = txn.open_table(SNAPSHOT_TABLE)?;
    let value = table.get(CURRENT_SNAPSHOT_KEY)?;

    Ok(value
        .map(|value| serde_json::from_slice(value.value()))
        .transpose()?)
}

fn restore(
    meta: &SnapshotMeta<NodeId, BasicNode>,
    bytes: &[u8],
) -> Result<StateMachineData, serde_json::Error> {
    Ok(StateMachineData {
        last_applied: meta.last_log_id,
        last_membership: meta.last_membership.clone(),
        kv: serde_json::from_slice(bytes)?,
    })
}

impl RaftSnapshotBuilder<TypeConfig> for StateMachineStore {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let (meta, data) = {
            let data = self.data.read().await;

            let bytes = serde_json::to_vec(&data.kv).map_err(|e| {
                io_error(ErrorSubject::StateMachine, ErrorVerb::Read)(Box::new(e))
            })?;

            let counter = self.snapshot_counter.fetch_add(1, Ordering::Relaxed) + 1;
            let snapshot_id = data.last_applied.map_or_else(
                || format!("--{counter}"),
                |id| format!("{}-{counter}", id.index),
            );

            let meta = SnapshotMeta {
                last_log_id: data.last_applied,
                last_membership: data.last_membership.clone(),
                snapshot_id,
            };

            (meta, bytes)
        };

        let stored = StoredSnapshot {
            meta: meta.clone(),
            data,
        };
        self.write_snapshot(&stored)
            .map_err(io_error(ErrorSubject::Snapshot(Some(meta.signature())), ErrorVerb::Write))?;

        debug!("built snapshot {}", meta.snapshot_id);

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(stored.data)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for StateMachineStore {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        let data = self.data.read().await;
        Ok((data.last_applied, data.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<Response>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut data = self.data.write().await;
        let mut responses = Vec::new();

        for entry in entries {
            let revision = entry.log_id.index;
            data.last_applied = Some(entry.log_id);

            match entry.payload {
                EntryPayload::Blank => responses.push(Response {
                    revision,
                    deleted: 0,
                }),
                EntryPayload::Normal(request) => {
                    let (response, event) = data.apply(revision, request);
                    if let Some(event) = event {
                        // No receivers is fine.
                        let _ = self.events.send(event);
                    }
                    responses.push(response);
                }
                EntryPayload::Membership(membership) => {
                    info!("applied membership change at {}", revision);
                    data.last_membership = StoredMembership::new(Some(entry.log_id), membership);
                    responses.push(Response {
                        revision,
                        deleted: 0,
                    });
                }
            }
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
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        info!("installing snapshot {}", meta.snapshot_id);

        let bytes = snapshot.into_inner();
        let restored = restore(meta, &bytes).map_err(|e| {
            io_error(ErrorSubject::Snapshot(Some(meta.signature())), ErrorVerb::Read)(Box::new(e))
        })?;

        self.write_snapshot(&StoredSnapshot {
            meta: meta.clone(),
            data: bytes,
        })
        .map_err(io_error(ErrorSubject::Snapshot(Some(meta.signature())), ErrorVerb::Write))?;

        *self.data.write().await = restored;
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let stored = read_snapshot(&self.db)
            .map_err(io_error(ErrorSubject::Snapshot(None), ErrorVerb::Read))?;

        Ok(stored.map(|stored| Snapshot {
            meta: stored.meta,
            snapshot: Box::new(Cursor::new(stored.data)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use openraft::CommittedLeaderId;

    fn put(key: &str, value: &'static str) -> Request {
        Request::put(key, value)
    }

    fn normal(index: u64, request: Request) -> Entry<TypeConfig> {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(request),
        }
    }

    fn store() -> (tempfile::TempDir, StateMachineStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = super::super::open(dir.path()).unwrap();
        (dir, StateMachineStore::open(db).unwrap())
    }

    #[tokio::test]
    async fn test_put_tracks_revisions() {
        let (_dir, mut sm) = store();

        sm.apply([normal(1, put("key", "a")), normal(2, put("key", "b"))])
            .await
            .unwrap();

        let kvs = sm.range("key", false).await;
        assert_eq!(kvs.len(), 1);
        assert_eq!(kvs[0].value, Bytes::from_static(b"b"));
        assert_eq!(kvs[0].create_revision, 1);
        assert_eq!(kvs[0].mod_revision, 2);
        assert_eq!(kvs[0].version, 2);
    }

    #[tokio::test]
    async fn test_prefix_range_and_delete() {
        let (_dir, mut sm) = store();
        let mut events = sm.subscribe();

        let responses = sm
            .apply([
                normal(1, put("/checks/a", "1")),
                normal(2, put("/checks/b", "2")),
                normal(3, put("/entities/a", "3")),
                normal(
                    4,
                    Request::Delete {
                        key: "/checks/a".to_string(),
                    },
                ),
                normal(
                    5,
                    Request::Delete {
                        key: "/checks/missing".to_string(),
                    },
                ),
            ])
            .await
            .unwrap();

        assert_eq!(responses[3].deleted, 1);
        assert_eq!(responses[4].deleted, 0);

        let checks = sm.range("/checks/", true).await;
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].key, "/checks/b");

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event.revision());
        }
        assert_eq!(seen, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_snapshot_is_restored_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut sm = StateMachineStore::open(super::super::open(dir.path()).unwrap()).unwrap();
            sm.apply([normal(1, put("key", "value"))]).await.unwrap();
            let snapshot = sm.build_snapshot().await.unwrap();
            assert_eq!(snapshot.meta.last_log_id.map(|id| id.index), Some(1));
        }

        let mut sm = StateMachineStore::open(super::super::open(dir.path()).unwrap()).unwrap();
        assert_eq!(sm.range("key", false).await.len(), 1);
        assert!(sm.get_current_snapshot().await.unwrap().is_some());
        assert_eq!(sm.last_applied().await.map(|id| id.index), Some(1));
    }
}
