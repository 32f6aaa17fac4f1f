//! Durable raft storage on a single `redb` database.

mod log_store;
mod state_machine;

pub use log_store::LogStore;
pub use state_machine::StateMachineStore;

use crate::error::BootstrapError;
use crate::types::NodeId;

use std::path::Path;
use std::sync::Arc;

use openraft::{AnyError, ErrorSubject, ErrorVerb, StorageError, StorageIOError};
use redb::{Database, TableDefinition};

const DATABASE_FILE: &str = "raft.redb";

/// Log entries keyed by index, JSON encoded.
const LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("raft_log");

/// Vote, committed and purge markers.
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("raft_meta");

/// The most recent state machine snapshot.
const SNAPSHOT_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshot");

/// Opens (or creates) the database under `dir` and makes sure every table exists.
pub fn open(dir: &Path) -> Result<Arc<Database>, BootstrapError> {
    let db = Database::create(dir.join(DATABASE_FILE)).map_err(redb::Error::from)?;

    let txn = db.begin_write().map_err(redb::Error::from)?;
    {
        txn.open_table(LOG_TABLE).map_err(redb::Error::from)?;
        txn.open_table(META_TABLE).map_err(redb::Error::from)?;
        txn.open_table(SNAPSHOT_TABLE).map_err(redb::Error::from)?;
    }
    txn.commit().map_err(redb::Error::from)?;

    Ok(Arc::new(db))
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Builds a raft storage error for a failed operation on `subject`.
fn io_error(
    subject: ErrorSubject<NodeId>,
    verb: ErrorVerb,
) -> impl FnOnce(BoxError) -> StorageError<NodeId> {
    move |e| StorageIOError::new(subject, verb, AnyError::error(e)).into()
}
