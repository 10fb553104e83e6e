//! Event-source lock
//!
//! Exactly one entry node redistributes finalized events. Candidates claim a
//! retained, watched key on the lock host; the first claim wins and holds
//! until the holder releases it or its session disconnects. Candidates that
//! still want the lock claim again as soon as the key clears.

use crate::event::PublishOptions;
use crate::node::NodeId;
use crate::retained::RetainedChange;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Retained key arbitrating the event source
pub const EVENT_SOURCE_KEY: &str = "ordo.event_source";

/// Claim published to the lock host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub key: String,
    pub holder: NodeId,
    pub session: String,
    pub opt: PublishOptions,
}

/// Release published to the lock host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub key: String,
    pub holder: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    /// This node became the event source
    Acquired,
    /// This node is no longer the event source
    Lost,
    /// Another node holds the lock, or nobody does
    HolderChanged(Option<NodeId>),
}

/// Reaction to a retained-key change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockUpdate {
    pub event: Option<LockEvent>,
    /// Claim to publish because the key cleared
    pub reclaim: Option<Claim>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Idle,
    Claiming,
    Holding,
}

/// Client side of the event-source lock
#[derive(Debug)]
pub struct EventSourceLock {
    key: String,
    node: NodeId,
    session: String,
    state: LockState,
    wanted: bool,
    holder: Option<NodeId>,
}

impl EventSourceLock {
    pub fn new(node: impl Into<NodeId>, session: impl Into<String>) -> Self {
        Self {
            key: EVENT_SOURCE_KEY.to_string(),
            node: node.into(),
            session: session.into(),
            state: LockState::Idle,
            wanted: false,
            holder: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Start competing for the lock
    pub fn acquire(&mut self) -> Claim {
        self.wanted = true;
        if self.state == LockState::Idle {
            self.state = LockState::Claiming;
        }
        self.claim()
    }

    fn claim(&self) -> Claim {
        Claim {
            key: self.key.clone(),
            holder: self.node.clone(),
            session: self.session.clone(),
            opt: PublishOptions::retained_watch(),
        }
    }

    pub fn on_change(&mut self, change: &RetainedChange) -> LockUpdate {
        if change.key != self.key {
            return LockUpdate::default();
        }
        let previous = std::mem::replace(&mut self.holder, change.holder.clone());
        let mine = change.session.as_deref() == Some(self.session.as_str());

        let event = if mine {
            if self.state == LockState::Holding {
                None
            } else if self.wanted {
                self.state = LockState::Holding;
                info!(node = %self.node, key = %self.key, "acquired event-source lock");
                Some(LockEvent::Acquired)
            } else {
                warn!(node = %self.node, key = %self.key, "granted a lock that is no longer wanted");
                None
            }
        } else if self.state == LockState::Holding {
            self.state = if self.wanted {
                LockState::Claiming
            } else {
                LockState::Idle
            };
            info!(node = %self.node, key = %self.key, holder = ?change.holder, "lost event-source lock");
            Some(LockEvent::Lost)
        } else if previous != change.holder {
            Some(LockEvent::HolderChanged(change.holder.clone()))
        } else {
            None
        };

        let reclaim = if self.wanted && change.holder.is_none() && self.state != LockState::Holding {
            self.state = LockState::Claiming;
            Some(self.claim())
        } else {
            None
        };

        LockUpdate { event, reclaim }
    }

    /// Stop competing. Returns the release to publish if the lock was held.
    pub fn release(&mut self) -> Option<Release> {
        self.wanted = false;
        let held = self.state == LockState::Holding;
        self.state = LockState::Idle;
        held.then(|| Release {
            key: self.key.clone(),
            holder: self.node.clone(),
        })
    }

    /// The release due when a granted claim is no longer wanted
    pub fn unwanted_grant(&self, change: &RetainedChange) -> Option<Release> {
        let mine = change.session.as_deref() == Some(self.session.as_str());
        (mine && !self.wanted && change.key == self.key).then(|| Release {
            key: self.key.clone(),
            holder: self.node.clone(),
        })
    }

    pub fn is_holder(&self) -> bool {
        self.state == LockState::Holding
    }

    pub fn holder(&self) -> Option<&NodeId> {
        self.holder.as_ref()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn session(&self) -> &str {
        &self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retained::RetainedTable;

    fn lock(node: &str) -> EventSourceLock {
        EventSourceLock::new(node, format!("{node}/s"))
    }

    #[test]
    fn test_single_holder_and_handover() {
        let mut table = RetainedTable::new();
        let mut e1 = lock("e1");
        let mut e2 = lock("e2");

        let c1 = e1.acquire();
        let c2 = e2.acquire();
        let s1 = table.claim(&c1.key, &c1.holder, &c1.session, &c1.opt).state;
        let s2 = table.claim(&c2.key, &c2.holder, &c2.session, &c2.opt).state;

        assert_eq!(e1.on_change(&s1).event, Some(LockEvent::Acquired));
        assert_eq!(
            e2.on_change(&s2).event,
            Some(LockEvent::HolderChanged(Some("e1".into())))
        );
        assert!(e1.is_holder() && !e2.is_holder());

        // e1's session disconnects: the key clears, e2 claims again
        let cleared = table.disconnect(e1.session()).remove(0);
        let update = e2.on_change(&cleared);
        assert_eq!(update.event, Some(LockEvent::HolderChanged(None)));
        let reclaim = update.reclaim.unwrap();
        let state = table
            .claim(&reclaim.key, &reclaim.holder, &reclaim.session, &reclaim.opt)
            .state;
        assert_eq!(e2.on_change(&state).event, Some(LockEvent::Acquired));
        assert_eq!(e2.holder().map(String::as_str), Some("e2"));
    }

    #[test]
    fn test_lost_lock_reclaims() {
        let mut e1 = lock("e1");
        let claim = e1.acquire();
        assert!(claim.opt.retain && claim.opt.watch && claim.opt.acknowledge);
        assert!(!claim.opt.exclude_me);

        let held = RetainedChange {
            key: EVENT_SOURCE_KEY.into(),
            holder: Some("e1".into()),
            session: Some("e1/s".into()),
        };
        e1.on_change(&held);

        let cleared = RetainedChange {
            key: EVENT_SOURCE_KEY.into(),
            holder: None,
            session: None,
        };
        let update = e1.on_change(&cleared);
        assert_eq!(update.event, Some(LockEvent::Lost));
        assert!(update.reclaim.is_some());
        assert!(!e1.is_holder());
    }

    #[test]
    fn test_release() {
        let mut e1 = lock("e1");
        assert!(e1.release().is_none());

        e1.acquire();
        e1.on_change(&RetainedChange {
            key: EVENT_SOURCE_KEY.into(),
            holder: Some("e1".into()),
            session: Some("e1/s".into()),
        });
        let release = e1.release().unwrap();
        assert_eq!(release.holder, "e1");
        assert!(!e1.is_holder());

        let update = e1.on_change(&RetainedChange {
            key: EVENT_SOURCE_KEY.into(),
            holder: None,
            session: None,
        });
        assert!(update.reclaim.is_none());
    }

    #[test]
    fn test_other_keys_ignored() {
        let mut e1 = lock("e1").with_key("other");
        e1.acquire();
        let update = e1.on_change(&RetainedChange {
            key: EVENT_SOURCE_KEY.into(),
            holder: Some("e1".into()),
            session: Some("e1/s".into()),
        });
        assert_eq!(update, LockUpdate::default());
    }
}
