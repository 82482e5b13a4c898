//! Durable set of topics the caller wants active.
//!
//! Membership persists across reconnects until the caller removes a
//! topic. After every successful open the whole set is replayed as
//! subscribe frames; re-subscribing an already-active topic is assumed to
//! be a server-side no-op.

use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

/// Registry of subscribed topics. Pure set semantics: membership only,
/// no ordering significance, no payload.
#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: RwLock<BTreeSet<String>>,
}

impl TopicRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a topic. Returns `false` if it was already present.
    pub fn insert(&self, topic: &str) -> bool {
        // A poisoned lock cannot leave a BTreeSet half-mutated
        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_owned())
    }

    /// Remove a topic. Returns `false` if it was not present.
    pub fn remove(&self, topic: &str) -> bool {
        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic)
    }

    #[must_use]
    pub fn contains(&self, topic: &str) -> bool {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(topic)
    }

    /// Snapshot of the current membership, for replay and status queries.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
