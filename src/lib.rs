//! Resilient WebSocket channel client for streaming telemetry and
//! analytics events.
//!
//! [`ChannelClient`] keeps a persistent bidirectional connection alive on
//! the application's behalf: it reconnects with exponential backoff,
//! monitors liveness with an application-level ping/pong heartbeat,
//! buffers outbound messages while disconnected, and replays topic
//! subscriptions after every reconnect. Inbound frames fan out to
//! registered callbacks by event kind.
//!
//! ```rust, no_run
//! use pulselink::{ChannelClient, Config, EventKind};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = ChannelClient::new("wss://telemetry.example.com/channel", Config::default())?;
//!
//!     client.subscribe(EventKind::StatsUpdate, |event| {
//!         println!("stats: {event:?}");
//!     });
//!     client.subscribe_topic("stats");
//!     client.connect();
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod client;
pub mod codec;
pub mod config;
mod connection;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod registry;
pub mod state;

pub use client::{ChannelClient, ChannelStatus, SendOutcome};
pub use config::{Config, ReconnectConfig};
pub use dispatcher::SubscriberId;
pub use error::{ChannelError, Error, Kind};
pub use event::{ChannelEvent, ConnectionNotice, EventKind, LinkStatus};
pub use state::ChannelState;

/// Result type alias for this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
