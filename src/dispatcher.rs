//! Fan-out of inbound events to registered callbacks.
//!
//! Each event kind maps to an insertion-ordered list of callbacks keyed
//! by a generated [`SubscriberId`], so the same closure can be registered
//! twice without ambiguity and removed precisely. A panicking callback is
//! caught and logged; siblings for the same event still run.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::event::{ChannelEvent, EventKind};

/// Opaque handle identifying one callback registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

type Callback = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

/// Registry and fan-out of event callbacks.
#[derive(Default)]
pub struct Dispatcher {
    handlers: DashMap<EventKind, Vec<(SubscriberId, Callback)>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for an event kind. Returns the id used to
    /// remove exactly this registration.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriberId
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        let id = SubscriberId::generate();
        self.handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove one registration by id. Returns `true` if it existed.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriberId) -> bool {
        let Some(mut entry) = self.handlers.get_mut(&kind) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|(registered, _)| *registered != id);
        before != entry.len()
    }

    /// Number of registrations for a kind.
    #[must_use]
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, |entry| entry.len())
    }

    /// Invoke every callback registered for the event's kind, in
    /// registration order. Internal events without a dispatchable kind
    /// are ignored.
    pub fn dispatch(&self, event: &ChannelEvent) {
        let Some(kind) = event.kind() else {
            return;
        };

        // Clone the callback list so user code runs without holding the
        // map shard lock (a callback may subscribe or unsubscribe)
        let callbacks: Vec<(SubscriberId, Callback)> = match self.handlers.get(&kind) {
            Some(entry) => entry.clone(),
            None => {
                tracing::trace!(?kind, "no subscribers for event");
                return;
            }
        };

        for (id, callback) in callbacks {
            let result = catch_unwind(AssertUnwindSafe(|| callback(event)));
            if let Err(panic) = result {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_owned());
                tracing::error!(%id, ?kind, %reason, "event callback panicked");
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("event_kinds", &self.handlers.len())
            .finish()
    }
}
