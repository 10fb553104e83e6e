//! Router events carried through segments

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Publish options attached to an event by the accepting gate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOptions {
    /// Publisher expects an acknowledgement
    pub acknowledge: bool,
    /// Keep the payload as the retained value of the topic
    pub retain: bool,
    /// Do not deliver back to the publishing session
    pub exclude_me: bool,
    /// Watch the retained value for changes
    pub watch: bool,
    pub headers: BTreeMap<String, String>,
}

impl PublishOptions {
    /// Options used for the event-source lock claim
    pub fn retained_watch() -> Self {
        Self {
            acknowledge: true,
            retain: true,
            exclude_me: false,
            watch: true,
            headers: BTreeMap::new(),
        }
    }
}

/// A published event as accepted by an entry node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterEvent {
    pub realm: String,
    pub uri: String,
    pub data: Vec<u8>,
    pub opt: PublishOptions,
    /// Publishing session
    pub sid: String,
}

impl RouterEvent {
    pub fn new(realm: impl Into<String>, uri: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            realm: realm.into(),
            uri: uri.into(),
            data: data.into(),
            opt: PublishOptions::default(),
            sid: String::new(),
        }
    }

    pub fn with_session(mut self, sid: impl Into<String>) -> Self {
        self.sid = sid.into();
        self
    }

    pub fn with_options(mut self, opt: PublishOptions) -> Self {
        self.opt = opt;
        self
    }
}

/// A finalized event with its cluster-wide id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalEvent {
    pub id: String,
    pub event: RouterEvent,
}
