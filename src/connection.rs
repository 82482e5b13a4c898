//! Connection lifecycle: dialing, reconnection with exponential backoff,
//! heartbeat liveness, and the post-open replay/drain sequence.
//!
//! A single spawned task owns the transport. It is the only mutator of
//! [`ChannelState`], which it publishes through a watch channel. Callers
//! talk to the task through an mpsc channel for outbound frames and a
//! cancellation token for shutdown, so no lock is ever held across the
//! transport.

use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use futures::stream::SplitSink;
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::buffer::{Intent, OutboundBuffer};
use crate::codec::{self, OutboundFrame};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::ChannelError;
use crate::event::{ChannelEvent, ConnectionNotice};
use crate::registry::TopicRegistry;
use crate::state::{ChannelState, StateInput};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// State shared between the client handle and the connection task.
#[derive(Debug)]
pub(crate) struct Shared {
    pub endpoint: String,
    pub config: Config,
    pub topics: TopicRegistry,
    pub buffer: Mutex<OutboundBuffer>,
    pub dispatcher: Dispatcher,
}

impl Shared {
    pub fn buffer_lock(&self) -> std::sync::MutexGuard<'_, OutboundBuffer> {
        // A poisoned lock cannot leave the VecDeque inconsistent
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a running connection loop.
#[derive(Debug)]
pub(crate) struct ConnectionHandle {
    pub outbound_tx: mpsc::UnboundedSender<Message>,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<()>,
}

/// Spawn the connection loop for one `connect()` call.
///
/// Each spawn starts with a fresh attempt counter and backoff schedule;
/// the caller-owned `state_tx` persists across spawns so state history is
/// continuous.
pub(crate) fn spawn(
    shared: std::sync::Arc<Shared>,
    state_tx: watch::Sender<ChannelState>,
) -> ConnectionHandle {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();

    let task = tokio::spawn(connection_loop(
        shared,
        state_tx,
        outbound_rx,
        shutdown.clone(),
    ));

    ConnectionHandle {
        outbound_tx,
        shutdown,
        task,
    }
}

fn apply(state_tx: &watch::Sender<ChannelState>, input: StateInput) {
    state_tx.send_modify(|state| *state = state.apply(input));
}

/// Main connection loop with automatic reconnection.
async fn connection_loop(
    shared: std::sync::Arc<Shared>,
    state_tx: watch::Sender<ChannelState>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    shutdown: CancellationToken,
) {
    let mut attempt = 0_u32;
    let mut backoff: ExponentialBackoff = shared.config.reconnect.clone().into();

    apply(&state_tx, StateInput::ConnectRequested);

    loop {
        let connect = tokio::select! {
            () = shutdown.cancelled() => {
                apply(&state_tx, StateInput::CloseRequested);
                return;
            }
            result = connect_async(&shared.endpoint) => result,
        };

        match connect {
            Ok((stream, _)) => {
                attempt = 0;
                backoff.reset();
                apply(&state_tx, StateInput::TransportOpened);

                match drive_connection(stream, &shared, &mut outbound_rx, &shutdown).await {
                    Ok(()) => {
                        // Caller-initiated shutdown; never reconnect
                        apply(&state_tx, StateInput::CloseRequested);
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "connection lost");
                        attempt = attempt.saturating_add(1);
                    }
                }
            }
            Err(e) => {
                attempt = attempt.saturating_add(1);
                tracing::warn!(error = %e, attempt, "unable to connect");
            }
        }

        if let Some(max) = shared.config.reconnect.max_attempts
            && attempt > max
        {
            tracing::error!(attempts = attempt, "reconnect attempts exhausted, giving up");
            apply(&state_tx, StateInput::RetriesExhausted);
            shared
                .dispatcher
                .dispatch(&ChannelEvent::Connection(ConnectionNotice::failed()));
            return;
        }

        apply(&state_tx, StateInput::TransportLost { attempt });

        if let Some(delay) = backoff.next_backoff() {
            tracing::debug!(?delay, attempt, "waiting before reconnect");
            tokio::select! {
                () = shutdown.cancelled() => {
                    apply(&state_tx, StateInput::CloseRequested);
                    return;
                }
                () = sleep(delay) => {}
            }
        }
    }
}

/// Handle one open transport until it drops, errors, or is shut down.
///
/// Returns `Ok(())` only on caller-initiated shutdown; every other exit
/// is a reconnectable error.
async fn drive_connection(
    stream: WsStream,
    shared: &Shared,
    outbound_rx: &mut mpsc::UnboundedReceiver<Message>,
    shutdown: &CancellationToken,
) -> Result<()> {
    let (mut write, mut read) = stream.split();

    // Flush order is strict: subscriptions first, then buffered envelopes,
    // then live traffic from the mpsc channel
    replay_subscriptions(&mut write, shared).await?;
    drain_buffer(&mut write, shared).await?;

    // Callbacks learn about the connection only once the flush completed,
    // so an observer sees its subscriptions replayed and the buffer empty
    shared
        .dispatcher
        .dispatch(&ChannelEvent::Connection(ConnectionNotice::connected()));

    let (pong_tx, pong_rx) = watch::channel(Instant::now());
    let (ping_tx, mut ping_rx) = mpsc::unbounded_channel();

    let mut heartbeat = tokio::spawn(heartbeat_loop(
        ping_tx,
        shared.config.clone(),
        pong_rx,
        shutdown.clone(),
    ));

    let result = loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                break Ok(());
            }

            verdict = &mut heartbeat => {
                match verdict {
                    Ok(HeartbeatVerdict::TimedOut) => {
                        shared.dispatcher.dispatch(&ChannelEvent::PongTimeout);
                        break Err(ChannelError::PongTimeout.into());
                    }
                    _ => break Err(ChannelError::ConnectionClosed.into()),
                }
            }

            message = read.next() => {
                match message {
                    Some(Ok(inbound @ (Message::Text(_) | Message::Binary(_)))) => {
                        handle_inbound(&inbound, shared, &pong_tx);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break Err(ChannelError::ConnectionClosed.into());
                    }
                    Some(Ok(_)) => {
                        // Protocol-level ping/pong frames are answered by tungstenite
                    }
                    Some(Err(e)) => {
                        break Err(ChannelError::Connection(e).into());
                    }
                }
            }

            Some(message) = outbound_rx.recv() => {
                if let Err(e) = write.send(message).await {
                    break Err(ChannelError::Connection(e).into());
                }
            }

            Some(()) = ping_rx.recv() => {
                let ping = match codec::encode_text(&OutboundFrame::ping()) {
                    Ok(message) => message,
                    Err(e) => break Err(e),
                };
                if let Err(e) = write.send(ping).await {
                    break Err(ChannelError::Connection(e).into());
                }
            }
        }
    };

    heartbeat.abort();
    result
}

/// Decode an inbound message and route it.
///
/// Pongs feed the liveness monitor; known events fan out through the
/// dispatcher; unknown types and decode failures are logged and dropped
/// without touching the connection.
fn handle_inbound(message: &Message, shared: &Shared, pong_tx: &watch::Sender<Instant>) {
    match codec::decode(message) {
        Ok(raw) => {
            let kind_name = raw.kind.clone();
            match ChannelEvent::from_frame(raw) {
                Some(ChannelEvent::Pong) => {
                    _ = pong_tx.send(Instant::now());
                }
                Some(event) => shared.dispatcher.dispatch(&event),
                None => {
                    tracing::warn!(kind = %kind_name, "unknown inbound event type, dropping");
                }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to decode inbound frame, dropping");
        }
    }
}

/// Re-send a subscribe frame for every registered topic.
async fn replay_subscriptions(write: &mut WsSink, shared: &Shared) -> Result<()> {
    let topics = shared.topics.snapshot();
    if topics.is_empty() {
        return Ok(());
    }

    tracing::debug!(count = topics.len(), "replaying topic subscriptions");
    for topic in topics {
        let frame = OutboundFrame::subscribe(&topic);
        write.send(codec::encode_text(&frame)?).await?;
    }
    Ok(())
}

/// Drain buffered envelopes in FIFO order.
///
/// A transmit failure re-buffers the failed envelope at the front and
/// halts the drain for this connection attempt; the remainder keeps its
/// order for the next attempt.
async fn drain_buffer(write: &mut WsSink, shared: &Shared) -> Result<()> {
    loop {
        let Some(envelope) = shared.buffer_lock().pop_front() else {
            return Ok(());
        };

        let encoded = match &envelope.intent {
            Intent::Message { frame, compressed } => codec::encode(frame, *compressed),
            Intent::Subscribe { topic } => codec::encode_text(&OutboundFrame::subscribe(topic)),
            Intent::Unsubscribe { topic } => codec::encode_text(&OutboundFrame::unsubscribe(topic)),
        };

        let message = match encoded {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(error = %e, "dropping buffered envelope that failed to encode");
                continue;
            }
        };

        if let Err(e) = write.send(message).await {
            shared.buffer_lock().requeue_front(envelope);
            return Err(ChannelError::Connection(e).into());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeartbeatVerdict {
    /// No pong arrived within the timeout; the connection is dead
    TimedOut,
    /// The connection is tearing down for another reason
    ChannelClosed,
}

/// Heartbeat loop: sends a ping every `ping_interval` and expects the
/// matching pong within `pong_timeout`.
async fn heartbeat_loop(
    ping_tx: mpsc::UnboundedSender<()>,
    config: Config,
    mut pong_rx: watch::Receiver<Instant>,
    shutdown: CancellationToken,
) -> HeartbeatVerdict {
    let mut ping_interval = interval(config.ping_interval);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => return HeartbeatVerdict::ChannelClosed,
            _ = ping_interval.tick() => {}
        }

        // Mark the current pong state as seen before sending the ping, so
        // changed() cannot fire on a stale pong
        drop(pong_rx.borrow_and_update());

        let ping_sent = Instant::now();
        if ping_tx.send(()).is_err() {
            // Message loop has terminated
            return HeartbeatVerdict::ChannelClosed;
        }

        match timeout(config.pong_timeout, pong_rx.changed()).await {
            Ok(Ok(())) => {
                let last_pong = *pong_rx.borrow_and_update();
                if last_pong < ping_sent {
                    tracing::debug!("pong predates the last ping, connection may be stale");
                    return HeartbeatVerdict::TimedOut;
                }
            }
            Ok(Err(_)) => {
                // Pong channel closed, connection is terminating
                return HeartbeatVerdict::ChannelClosed;
            }
            Err(_) => {
                tracing::warn!(
                    timeout = ?config.pong_timeout,
                    "no pong within timeout, forcing reconnect"
                );
                return HeartbeatVerdict::TimedOut;
            }
        }
    }
}
