//! Public channel client API.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::watch;

use crate::Result;
use crate::buffer::{Envelope, OutboundBuffer};
use crate::codec::{self, OutboundFrame};
use crate::config::Config;
use crate::connection::{self, ConnectionHandle, Shared};
use crate::dispatcher::{Dispatcher, SubscriberId};
use crate::error::Error;
use crate::event::{ChannelEvent, EventKind};
use crate::registry::TopicRegistry;
use crate::state::{ChannelState, StateInput};

/// Result of a `send` call.
///
/// Sending while disconnected is not an error: the frame is buffered and
/// flushed after the next successful (re)connect.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The frame was handed to the transport
    Sent,
    /// The frame was queued for delivery after reconnect
    Buffered,
}

impl SendOutcome {
    /// Check whether the frame went out immediately.
    #[must_use]
    pub const fn is_sent(self) -> bool {
        matches!(self, Self::Sent)
    }
}

/// Snapshot of the client's externally observable state.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ChannelStatus {
    /// Whether the transport is currently open
    pub connected: bool,
    /// Current reconnection attempt count; zero while healthy
    pub reconnect_attempts: u32,
    /// Topics the caller wants active
    pub subscriptions: Vec<String>,
    /// Envelopes waiting for the next reconnect
    pub buffer_size: usize,
    /// The raw connection state
    pub state: ChannelState,
}

/// Resilient real-time channel client.
///
/// Maintains a persistent WebSocket connection for streaming telemetry
/// events, reconnecting with exponential backoff, replaying topic
/// subscriptions, and flushing messages buffered while offline.
///
/// # Example
///
/// ```rust, no_run
/// use pulselink::{ChannelClient, Config, EventKind};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let client = ChannelClient::new("wss://telemetry.example.com/channel", Config::default())?;
///
///     client.subscribe(EventKind::Alert, |event| {
///         println!("alert: {event:?}");
///     });
///     client.subscribe_topic("alerts");
///     client.connect();
///
///     client.send("client_hello", json!({ "agent": "pulselink" }));
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ChannelClient {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    shared: Arc<Shared>,
    state_tx: watch::Sender<ChannelState>,
    state_rx: watch::Receiver<ChannelState>,
    connection: Mutex<Option<ConnectionHandle>>,
}

impl ChannelClient {
    /// Create a client for the given endpoint. No connection is made
    /// until [`connect`](Self::connect) is called.
    pub fn new(endpoint: &str, config: Config) -> Result<Self> {
        if !endpoint.starts_with("ws://") && !endpoint.starts_with("wss://") {
            return Err(Error::validation(format!(
                "endpoint must be a ws:// or wss:// URL, got {endpoint}"
            )));
        }

        let buffer = OutboundBuffer::new(config.buffer_capacity);
        let shared = Arc::new(Shared {
            endpoint: endpoint.to_owned(),
            config,
            topics: TopicRegistry::new(),
            buffer: Mutex::new(buffer),
            dispatcher: Dispatcher::new(),
        });
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);

        Ok(Self {
            inner: Arc::new(ClientInner {
                shared,
                state_tx,
                state_rx,
                connection: Mutex::new(None),
            }),
        })
    }

    /// Start the connection loop.
    ///
    /// Idempotent: a no-op while a loop is already running. After a
    /// terminal failure or [`disconnect`](Self::disconnect), calling this
    /// again restarts with a fresh attempt counter.
    pub fn connect(&self) {
        let mut guard = self.connection_lock();
        if let Some(handle) = guard.as_ref()
            && !handle.task.is_finished()
        {
            tracing::debug!("connect ignored, connection loop already running");
            return;
        }

        let handle = connection::spawn(
            Arc::clone(&self.inner.shared),
            self.inner.state_tx.clone(),
        );
        *guard = Some(handle);
    }

    /// Close the connection and cancel every pending timer.
    ///
    /// Intentional: no reconnect is attempted and no further callbacks
    /// fire for this connection. The topic registry and outbound buffer
    /// are preserved for a later [`connect`](Self::connect).
    pub fn disconnect(&self) {
        let mut guard = self.connection_lock();
        if let Some(handle) = guard.take() {
            handle.shutdown.cancel();
            handle.task.abort();
        }
        self.inner
            .state_tx
            .send_modify(|state| *state = state.apply(StateInput::CloseRequested));
    }

    /// Send an application frame as JSON text.
    pub fn send(&self, event_type: impl Into<String>, payload: Value) -> SendOutcome {
        self.send_frame(OutboundFrame::new(event_type, payload), false)
    }

    /// Send an application frame using the compressed binary encoding.
    pub fn send_compressed(&self, event_type: impl Into<String>, payload: Value) -> SendOutcome {
        self.send_frame(OutboundFrame::new(event_type, payload), true)
    }

    fn send_frame(&self, frame: OutboundFrame, compressed: bool) -> SendOutcome {
        if self.state().is_connected()
            && let Some(handle) = self.connection_lock().as_ref()
        {
            match codec::encode(&frame, compressed) {
                Ok(message) => {
                    if handle.outbound_tx.send(message).is_ok() {
                        return SendOutcome::Sent;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode outbound frame, buffering");
                }
            }
        }

        self.inner
            .shared
            .buffer_lock()
            .push(Envelope::message(frame, compressed));
        SendOutcome::Buffered
    }

    /// Register interest in a topic.
    ///
    /// Membership survives reconnects; while disconnected the intent is
    /// carried by the registry and replayed after the next open.
    pub fn subscribe_topic(&self, topic: &str) {
        self.inner.shared.topics.insert(topic);
        if self.state().is_connected() {
            self.transmit_or_buffer(&OutboundFrame::subscribe(topic), Envelope::subscribe(topic));
        }
    }

    /// Drop interest in a topic.
    pub fn unsubscribe_topic(&self, topic: &str) {
        self.inner.shared.topics.remove(topic);
        if self.state().is_connected() {
            self.transmit_or_buffer(
                &OutboundFrame::unsubscribe(topic),
                Envelope::unsubscribe(topic),
            );
        }
    }

    /// Hand a control frame to the transport, or buffer the intent when
    /// the connection loop is gone despite the state still reading
    /// connected. The buffered intent is flushed on the next open.
    fn transmit_or_buffer(&self, frame: &OutboundFrame, envelope: Envelope) {
        if let Some(handle) = self.connection_lock().as_ref()
            && let Ok(message) = codec::encode_text(frame)
            && handle.outbound_tx.send(message).is_ok()
        {
            return;
        }
        self.inner.shared.buffer_lock().push(envelope);
    }

    /// Register a callback for an event kind. Multiple independent
    /// callbacks per kind are supported; they run in registration order.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriberId
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.inner.shared.dispatcher.subscribe(kind, callback)
    }

    /// Remove one callback registration. Returns `true` if it existed.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriberId) -> bool {
        self.inner.shared.dispatcher.unsubscribe(kind, id)
    }

    /// The current connection state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.inner.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    ///
    /// Useful for awaiting reconnections or terminal failure in tests
    /// and supervisors.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ChannelState> {
        self.inner.state_tx.subscribe()
    }

    /// Snapshot of the externally observable client state.
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        let state = self.state();
        ChannelStatus {
            connected: state.is_connected(),
            reconnect_attempts: state.reconnect_attempts(),
            subscriptions: self.inner.shared.topics.snapshot(),
            buffer_size: self.inner.shared.buffer_lock().len(),
            state,
        }
    }

    fn connection_lock(&self) -> std::sync::MutexGuard<'_, Option<ConnectionHandle>> {
        // A poisoned lock cannot leave Option<ConnectionHandle> inconsistent
        self.inner
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
