//! Inbound event classification.
//!
//! Inbound frames resolve into a closed set of [`ChannelEvent`] variants
//! rather than an open string-keyed dictionary, so dispatch can be
//! matched exhaustively. The reserved `pong` frame is consumed by the
//! liveness monitor and never reaches application callbacks.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::RawFrame;

/// A fully classified inbound event.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Heartbeat acknowledgement; internal, never dispatched
    Pong,
    /// Periodic telemetry statistics
    StatsUpdate(Value),
    /// A raised alert
    Alert(Value),
    /// A change in the observed network topology
    TopologyUpdate(Value),
    /// Locally synthesized connection lifecycle notice
    Connection(ConnectionNotice),
    /// Locally synthesized liveness failure notice
    PongTimeout,
}

impl ChannelEvent {
    /// Classify a decoded raw frame. Returns `None` for unknown event
    /// types, which callers log and drop.
    #[must_use]
    pub fn from_frame(frame: RawFrame) -> Option<Self> {
        match frame.kind.as_str() {
            "pong" => Some(Self::Pong),
            "stats_update" => Some(Self::StatsUpdate(frame.payload)),
            "alert" => Some(Self::Alert(frame.payload)),
            "topology_update" => Some(Self::TopologyUpdate(frame.payload)),
            "connection" => serde_json::from_value(frame.payload)
                .ok()
                .map(Self::Connection),
            "pong_timeout" => Some(Self::PongTimeout),
            _ => None,
        }
    }

    /// The dispatchable kind of this event, or `None` for frames that are
    /// consumed internally.
    #[must_use]
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            Self::Pong => None,
            Self::StatsUpdate(_) => Some(EventKind::StatsUpdate),
            Self::Alert(_) => Some(EventKind::Alert),
            Self::TopologyUpdate(_) => Some(EventKind::TopologyUpdate),
            Self::Connection(_) => Some(EventKind::Connection),
            Self::PongTimeout => Some(EventKind::PongTimeout),
        }
    }
}

/// Event types callbacks can register for.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `stats_update` frames
    StatsUpdate,
    /// `alert` frames
    Alert,
    /// `topology_update` frames
    TopologyUpdate,
    /// Connection lifecycle notices
    Connection,
    /// Liveness failures
    PongTimeout,
}

/// Connection lifecycle status carried by [`ChannelEvent::Connection`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    /// The transport opened and the post-connect sequence completed
    Connected,
    /// Reconnection attempts were exhausted; terminal
    Failed,
}

/// Payload of a connection lifecycle event.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionNotice {
    /// New connection status
    pub status: LinkStatus,
}

impl ConnectionNotice {
    #[must_use]
    pub fn connected() -> Self {
        Self {
            status: LinkStatus::Connected,
        }
    }

    #[must_use]
    pub fn failed() -> Self {
        Self {
            status: LinkStatus::Failed,
        }
    }
}
