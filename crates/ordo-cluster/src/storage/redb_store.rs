//! redb-backed event history
//!
//! Records are postcard-encoded and keyed by final id. redb keeps `&str`
//! keys in byte order, which is the order of final ids.

use super::{HistoryRecord, HistoryStore};
use crate::error::{ClusterError, Result};
use crate::event::{FinalEvent, PublishOptions};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Table for history records (key: final id, value: serialized record)
const HISTORY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("event_history");

fn storage(e: impl std::fmt::Display) -> ClusterError {
    ClusterError::Storage(e.to_string())
}

/// Durable history in a single redb file
#[derive(Clone)]
pub struct RedbHistory {
    db: Arc<Database>,
}

impl RedbHistory {
    /// Open or create the database at `path`, creating parent directories
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)
            .map_err(|e| ClusterError::Storage(format!("failed to open redb: {e}")))?;

        let write_txn = db.begin_write().map_err(storage)?;
        {
            write_txn.open_table(HISTORY_TABLE).map_err(storage)?;
        }
        write_txn.commit().map_err(storage)?;

        let store = Self { db: Arc::new(db) };
        info!(path = %path.display(), max_id = ?store.scan_max_id()?, "opened event history");
        Ok(store)
    }

    fn write(&self, records: &[(&str, HistoryRecord)]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let write_txn = self.db.begin_write().map_err(storage)?;
        {
            let mut table = write_txn.open_table(HISTORY_TABLE).map_err(storage)?;
            for (id, record) in records {
                let value = postcard::to_allocvec(record)?;
                table.insert(*id, value.as_slice()).map_err(storage)?;
            }
        }
        write_txn.commit().map_err(storage)?;
        Ok(())
    }
}

impl HistoryStore for RedbHistory {
    fn save_event_history(
        &self,
        id: &str,
        realm: &str,
        uri: &str,
        body: &[u8],
        opt: &PublishOptions,
    ) -> Result<()> {
        self.write(&[(id, HistoryRecord::new(realm, uri, body, opt))])
    }

    /// One transaction per segment
    fn save_segment(&self, events: &[FinalEvent]) -> Result<()> {
        let records: Vec<(&str, HistoryRecord)> = events
            .iter()
            .map(|event| (event.id.as_str(), HistoryRecord::from(event)))
            .collect();
        self.write(&records)?;
        debug!(count = events.len(), "persisted segment history");
        Ok(())
    }

    fn scan_max_id(&self) -> Result<Option<String>> {
        let read_txn = self.db.begin_read().map_err(storage)?;
        let table = read_txn.open_table(HISTORY_TABLE).map_err(storage)?;
        let mut iter = table.iter().map_err(storage)?;
        let max = match iter.next_back() {
            Some(entry) => {
                let (key, _) = entry.map_err(storage)?;
                Some(key.value().to_string())
            }
            None => None,
        };
        Ok(max)
    }

    fn get(&self, id: &str) -> Result<Option<HistoryRecord>> {
        let read_txn = self.db.begin_read().map_err(storage)?;
        let table = read_txn.open_table(HISTORY_TABLE).map_err(storage)?;
        match table.get(id).map_err(storage)? {
            Some(value) => {
                let record = postcard::from_bytes(value.value())
                    .map_err(|e| ClusterError::CorruptData(format!("history record {id}: {e}")))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn len(&self) -> Result<usize> {
        let read_txn = self.db.begin_read().map_err(storage)?;
        let table = read_txn.open_table(HISTORY_TABLE).map_err(storage)?;
        Ok(table.len().map_err(storage)? as usize)
    }
}
