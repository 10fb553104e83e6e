//! Event history persisted by storage replicas
//!
//! Every entry node is a storage replica. Once a segment is elected, the
//! replica writes each of its events under the event's final id and votes
//! the last id it wrote into the commit watermark.
//!
//! - **redb** ([`RedbHistory`]): durable, pure Rust, one table keyed by
//!   final id
//! - **memory** ([`MemoryHistory`]): for tests and standalone nodes
//!
//! Final ids sort in commit order, so the largest key is the newest event.
//!
//! ```ignore
//! use ordo_cluster::storage::{HistoryStore, RedbHistory};
//!
//! let store = RedbHistory::open("/var/lib/ordo/history.redb")?;
//! let resume_from = store.scan_max_id()?;
//! ```

mod redb_store;

pub use redb_store::RedbHistory;

use crate::error::Result;
use crate::event::{FinalEvent, PublishOptions};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One persisted event, stored under its final id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub realm: String,
    pub uri: String,
    pub body: Vec<u8>,
    pub opt: PublishOptions,
}

impl HistoryRecord {
    pub fn new(realm: &str, uri: &str, body: &[u8], opt: &PublishOptions) -> Self {
        Self {
            realm: realm.to_string(),
            uri: uri.to_string(),
            body: body.to_vec(),
            opt: opt.clone(),
        }
    }
}

impl From<&FinalEvent> for HistoryRecord {
    fn from(event: &FinalEvent) -> Self {
        Self::new(
            &event.event.realm,
            &event.event.uri,
            &event.event.data,
            &event.event.opt,
        )
    }
}

/// Durable event history
pub trait HistoryStore: Send + Sync {
    /// Write one event under its final id. Rewriting an id is a no-op
    /// overwrite with the same record.
    fn save_event_history(
        &self,
        id: &str,
        realm: &str,
        uri: &str,
        body: &[u8],
        opt: &PublishOptions,
    ) -> Result<()>;

    /// Write a whole segment. Stores with transactions write it atomically.
    fn save_segment(&self, events: &[FinalEvent]) -> Result<()> {
        for event in events {
            self.save_event_history(
                &event.id,
                &event.event.realm,
                &event.event.uri,
                &event.event.data,
                &event.event.opt,
            )?;
        }
        Ok(())
    }

    /// Largest final id persisted so far
    fn scan_max_id(&self) -> Result<Option<String>>;

    fn get(&self, id: &str) -> Result<Option<HistoryRecord>>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// In-memory history
#[derive(Debug, Default)]
pub struct MemoryHistory {
    records: RwLock<BTreeMap<String, HistoryRecord>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// All ids in order
    pub fn ids(&self) -> Vec<String> {
        self.records.read().keys().cloned().collect()
    }
}

impl HistoryStore for MemoryHistory {
    fn save_event_history(
        &self,
        id: &str,
        realm: &str,
        uri: &str,
        body: &[u8],
        opt: &PublishOptions,
    ) -> Result<()> {
        self.records
            .write()
            .insert(id.to_string(), HistoryRecord::new(realm, uri, body, opt));
        Ok(())
    }

    fn scan_max_id(&self) -> Result<Option<String>> {
        Ok(self.records.read().keys().next_back().cloned())
    }

    fn get(&self, id: &str) -> Result<Option<HistoryRecord>> {
        Ok(self.records.read().get(id).cloned())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.records.read().len())
    }
}
