//! Retained-value table with first-claimant-wins semantics
//!
//! Hosted by one sync node. A retained claim on a key is held until its
//! holder releases it or the holding session disconnects, after which the
//! key is open for the next claimant. Watching sessions are told about
//! every change of a key.

use crate::event::PublishOptions;
use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// New state of a retained key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetainedChange {
    pub key: String,
    pub holder: Option<NodeId>,
    pub session: Option<String>,
}

impl RetainedChange {
    fn cleared(key: &str) -> Self {
        Self {
            key: key.to_string(),
            holder: None,
            session: None,
        }
    }
}

/// Result of a claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claimed {
    /// The claimant holds the key
    pub granted: bool,
    /// The claim changed the key
    pub changed: bool,
    /// Current state of the key, for the acknowledgement
    pub state: RetainedChange,
}

#[derive(Debug, Clone)]
struct RetainedEntry {
    holder: NodeId,
    session: String,
}

/// First-claimant-wins retained table
#[derive(Debug, Default)]
pub struct RetainedTable {
    entries: BTreeMap<String, RetainedEntry>,
    watchers: BTreeMap<String, BTreeSet<String>>,
}

impl RetainedTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&mut self, key: &str, holder: &NodeId, session: &str, opt: &PublishOptions) -> Claimed {
        if opt.watch {
            self.watchers
                .entry(key.to_string())
                .or_default()
                .insert(session.to_string());
        }

        let (granted, changed) = match self.entries.get(key) {
            Some(entry) => (entry.session == session, false),
            None if opt.retain => {
                self.entries.insert(
                    key.to_string(),
                    RetainedEntry {
                        holder: holder.clone(),
                        session: session.to_string(),
                    },
                );
                debug!(key = %key, holder = %holder, "retained claim granted");
                (true, true)
            }
            None => (false, false),
        };

        Claimed {
            granted,
            changed,
            state: self.state(key),
        }
    }

    /// Release a key held by `holder`
    pub fn release(&mut self, key: &str, holder: &NodeId) -> Option<RetainedChange> {
        match self.entries.get(key) {
            Some(entry) if &entry.holder == holder => {
                self.entries.remove(key);
                debug!(key = %key, holder = %holder, "retained claim released");
                Some(RetainedChange::cleared(key))
            }
            _ => None,
        }
    }

    /// Drop every claim and watch of a disconnected session
    pub fn disconnect(&mut self, session: &str) -> Vec<RetainedChange> {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.session == session)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            self.entries.remove(key);
            debug!(key = %key, session = %session, "retained claim cleared by disconnect");
        }
        for sessions in self.watchers.values_mut() {
            sessions.remove(session);
        }
        self.watchers.retain(|_, sessions| !sessions.is_empty());
        keys.iter().map(|key| RetainedChange::cleared(key)).collect()
    }

    /// Sessions holding claims or watches on behalf of `node`
    pub fn sessions_of(&self, node: &NodeId) -> Vec<String> {
        let mut sessions: BTreeSet<String> = self
            .entries
            .values()
            .filter(|entry| &entry.holder == node)
            .map(|entry| entry.session.clone())
            .collect();
        let prefix = format!("{node}/");
        for watching in self.watchers.values() {
            sessions.extend(watching.iter().filter(|s| s.starts_with(&prefix)).cloned());
        }
        sessions.into_iter().collect()
    }

    pub fn state(&self, key: &str) -> RetainedChange {
        match self.entries.get(key) {
            Some(entry) => RetainedChange {
                key: key.to_string(),
                holder: Some(entry.holder.clone()),
                session: Some(entry.session.clone()),
            },
            None => RetainedChange::cleared(key),
        }
    }

    pub fn holder(&self, key: &str) -> Option<&NodeId> {
        self.entries.get(key).map(|entry| &entry.holder)
    }

    pub fn has_watchers(&self, key: &str) -> bool {
        self.watchers.get(key).map_or(false, |s| !s.is_empty())
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }
}
