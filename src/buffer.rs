//! Bounded FIFO of outbound intents accumulated while disconnected.
//!
//! When the buffer is full the oldest envelope is evicted before the new
//! one is appended. Favoring recency over completeness is a deliberate
//! lossy policy, not a delivery guarantee; sustained overflow drops the
//! oldest traffic first and never reorders.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::codec::OutboundFrame;

/// A buffered outbound intent awaiting transmission.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Envelope {
    /// What to transmit once the connection recovers
    pub intent: Intent,
    /// When the intent was queued
    pub enqueued_at: DateTime<Utc>,
}

impl Envelope {
    #[must_use]
    pub fn message(frame: OutboundFrame, compressed: bool) -> Self {
        Self {
            intent: Intent::Message { frame, compressed },
            enqueued_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn subscribe(topic: impl Into<String>) -> Self {
        Self {
            intent: Intent::Subscribe {
                topic: topic.into(),
            },
            enqueued_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn unsubscribe(topic: impl Into<String>) -> Self {
        Self {
            intent: Intent::Unsubscribe {
                topic: topic.into(),
            },
            enqueued_at: Utc::now(),
        }
    }
}

/// The kind of buffered intent.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Intent {
    /// An application message, with its chosen encoding
    Message {
        /// The frame to encode at flush time
        frame: OutboundFrame,
        /// Whether to use the compressed binary encoding
        compressed: bool,
    },
    /// A topic subscribe intent
    Subscribe {
        /// Topic to subscribe to
        topic: String,
    },
    /// A topic unsubscribe intent
    Unsubscribe {
        /// Topic to unsubscribe from
        topic: String,
    },
}

/// Bounded FIFO of [`Envelope`]s.
#[derive(Debug)]
pub struct OutboundBuffer {
    entries: VecDeque<Envelope>,
    capacity: usize,
    /// Envelopes evicted since construction, for diagnostics
    evicted: u64,
}

impl OutboundBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            evicted: 0,
        }
    }

    /// Append an envelope, evicting the oldest entry if at capacity.
    pub fn push(&mut self, envelope: Envelope) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
            self.evicted = self.evicted.saturating_add(1);
            tracing::debug!(
                capacity = self.capacity,
                total_evicted = self.evicted,
                "outbound buffer full, evicted oldest envelope"
            );
        }
        self.entries.push_back(envelope);
    }

    /// Remove and return the oldest envelope.
    pub fn pop_front(&mut self) -> Option<Envelope> {
        self.entries.pop_front()
    }

    /// Put an envelope back at the front after a failed transmit, so the
    /// next drain resumes in the original order.
    pub fn requeue_front(&mut self, envelope: Envelope) {
        if self.entries.len() >= self.capacity {
            // Full again; recency policy still applies to the tail
            self.entries.pop_back();
            self.evicted = self.evicted.saturating_add(1);
        }
        self.entries.push_front(envelope);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total envelopes evicted by the overflow policy.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}
