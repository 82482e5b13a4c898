//! Connection state machine.
//!
//! All lifecycle transitions funnel through [`ChannelState::apply`], so
//! invalid moves (for example a transport event arriving after the client
//! was closed) are absorbed instead of corrupting state.

use std::time::Instant;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not connected and no connection in progress
    Disconnected,
    /// First connection attempt in flight
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: Instant,
    },
    /// Waiting out a backoff delay before retrying
    Reconnecting {
        /// Current reconnection attempt number
        attempt: u32,
    },
    /// Terminal: closed by the caller or retries exhausted
    Closed,
}

/// Inputs that drive state transitions.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateInput {
    /// The caller requested a connection
    ConnectRequested,
    /// The transport handshake completed
    TransportOpened,
    /// The transport closed or errored while not intentional
    TransportLost {
        /// Attempt number for the upcoming retry
        attempt: u32,
    },
    /// The retry budget is spent
    RetriesExhausted,
    /// The caller requested shutdown
    CloseRequested,
}

impl ChannelState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Check if the client reached a terminal state.
    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }

    /// The current reconnection attempt count; zero whenever a connection
    /// is healthy or none was lost.
    #[must_use]
    pub const fn reconnect_attempts(self) -> u32 {
        match self {
            Self::Reconnecting { attempt } => attempt,
            _ => 0,
        }
    }

    /// Apply a lifecycle input, returning the successor state.
    ///
    /// `CloseRequested` wins from any state. `Closed` only leaves via
    /// `ConnectRequested`; transport events arriving after close are
    /// ignored.
    #[must_use]
    pub fn apply(self, input: StateInput) -> Self {
        match (self, input) {
            (_, StateInput::CloseRequested) => Self::Closed,
            (Self::Closed, StateInput::ConnectRequested) => Self::Connecting,
            (Self::Closed, _) => Self::Closed,
            (Self::Disconnected, StateInput::ConnectRequested) => Self::Connecting,
            (_, StateInput::TransportOpened) => Self::Connected {
                since: Instant::now(),
            },
            (_, StateInput::TransportLost { attempt }) => Self::Reconnecting { attempt },
            (_, StateInput::RetriesExhausted) => Self::Closed,
            (current, StateInput::ConnectRequested) => current,
        }
    }
}
