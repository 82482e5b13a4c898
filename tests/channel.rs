#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::io::Read as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use pulselink::{ChannelClient, ChannelEvent, ChannelState, Config, EventKind, LinkStatus};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

/// Mock channel server speaking the frame protocol.
///
/// Answers application-level pings with pongs (unless told not to),
/// forwards every other decoded frame to the test, and can kick all
/// connected clients to simulate a dropped link.
struct MockChannelServer {
    addr: SocketAddr,
    /// Broadcast raw text to ALL connected clients
    message_tx: broadcast::Sender<String>,
    /// Receives decoded non-ping frames from clients
    frame_rx: mpsc::UnboundedReceiver<Value>,
    connections: Arc<AtomicUsize>,
    answer_pings: Arc<AtomicBool>,
    disconnect_signal: Arc<AtomicBool>,
}

impl MockChannelServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (message_tx, _) = broadcast::channel::<String>(100);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Value>();
        let connections = Arc::new(AtomicUsize::new(0));
        let answer_pings = Arc::new(AtomicBool::new(true));
        let disconnect_signal = Arc::new(AtomicBool::new(false));

        let broadcast_tx = message_tx.clone();
        let connection_count = Arc::clone(&connections);
        let pongs = Arc::clone(&answer_pings);
        let disconnect = Arc::clone(&disconnect_signal);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };

                connection_count.fetch_add(1, Ordering::SeqCst);

                let (mut write, mut read) = ws_stream.split();
                let frame_tx = frame_tx.clone();
                let mut msg_rx = broadcast_tx.subscribe();
                let pongs = Arc::clone(&pongs);
                let disconnect = Arc::clone(&disconnect);

                tokio::spawn(async move {
                    loop {
                        if disconnect.load(Ordering::SeqCst) {
                            break;
                        }

                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
                                            continue;
                                        };
                                        if frame["type"] == "ping" {
                                            if pongs.load(Ordering::SeqCst) {
                                                let pong = json!({"type": "pong", "payload": null});
                                                if write.send(Message::Text(pong.to_string().into())).await.is_err() {
                                                    break;
                                                }
                                            }
                                        } else {
                                            drop(frame_tx.send(frame));
                                        }
                                    }
                                    Some(Ok(Message::Binary(bytes))) => {
                                        // Length-prefixed zlib layout
                                        let body = &bytes[4..];
                                        let mut json_bytes = Vec::new();
                                        let mut decoder = flate2::read::ZlibDecoder::new(body);
                                        if decoder.read_to_end(&mut json_bytes).is_err() {
                                            continue;
                                        }
                                        let Ok(frame) = serde_json::from_slice::<Value>(&json_bytes) else {
                                            continue;
                                        };
                                        drop(frame_tx.send(frame));
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            msg = msg_rx.recv() => {
                                match msg {
                                    Ok(text) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                            () = tokio::time::sleep(Duration::from_millis(25)) => {
                                if disconnect.load(Ordering::SeqCst) {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            message_tx,
            frame_rx,
            connections,
            answer_pings,
            disconnect_signal,
        }
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/channel", self.addr)
    }

    /// Send a raw frame to all connected clients.
    fn send(&self, message: &str) {
        drop(self.message_tx.send(message.to_owned()));
    }

    fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn stop_answering_pings(&self) {
        self.answer_pings.store(false, Ordering::SeqCst);
    }

    fn disconnect_all(&self) {
        self.disconnect_signal.store(true, Ordering::SeqCst);
    }

    fn allow_reconnect(&self) {
        self.disconnect_signal.store(false, Ordering::SeqCst);
    }

    /// Receive the next decoded client frame.
    async fn recv_frame(&mut self) -> Option<Value> {
        timeout(Duration::from_secs(2), self.frame_rx.recv())
            .await
            .ok()
            .flatten()
    }
}

fn quick_config() -> Config {
    let mut config = Config::default();
    config.reconnect.max_attempts = Some(5);
    config.reconnect.initial_backoff = Duration::from_millis(50);
    config.reconnect.max_backoff = Duration::from_millis(200);
    config
}

async fn wait_connected(client: &ChannelClient) {
    let mut state_rx = client.state_receiver();
    timeout(
        Duration::from_secs(2),
        state_rx.wait_for(|state| state.is_connected()),
    )
    .await
    .expect("client should connect")
    .expect("state channel should stay open");
}

/// Collect dispatched events through a channel so tests can await them.
fn event_channel(
    client: &ChannelClient,
    kind: EventKind,
) -> mpsc::UnboundedReceiver<ChannelEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.subscribe(kind, move |event| {
        drop(tx.send(event.clone()));
    });
    rx
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

mod connect {
    use super::*;

    #[tokio::test]
    async fn dispatches_connection_notice_and_inbound_events() {
        let server = MockChannelServer::start().await;
        let client = ChannelClient::new(&server.ws_url(), quick_config()).unwrap();

        let mut connections = event_channel(&client, EventKind::Connection);
        let mut alerts = event_channel(&client, EventKind::Alert);

        client.connect();
        wait_connected(&client).await;

        let notice = next_event(&mut connections).await;
        let ChannelEvent::Connection(notice) = notice else {
            panic!("expected connection notice, got {notice:?}");
        };
        assert_eq!(notice.status, LinkStatus::Connected);

        server.send(&json!({"type": "alert", "payload": {"severity": "high"}}).to_string());

        let event = next_event(&mut alerts).await;
        let ChannelEvent::Alert(payload) = event else {
            panic!("expected alert, got {event:?}");
        };
        assert_eq!(payload["severity"], "high");
    }

    #[tokio::test]
    async fn connect_is_idempotent_while_running() {
        let server = MockChannelServer::start().await;
        let client = ChannelClient::new(&server.ws_url(), quick_config()).unwrap();

        client.connect();
        wait_connected(&client).await;
        client.connect();
        client.connect();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            server.connection_count(),
            1,
            "duplicate connect calls must not open extra connections"
        );
    }

    #[tokio::test]
    async fn send_returns_sent_while_connected() {
        let mut server = MockChannelServer::start().await;
        let client = ChannelClient::new(&server.ws_url(), quick_config()).unwrap();

        client.connect();
        wait_connected(&client).await;

        let outcome = client.send("stats_update", json!({"cpu": 0.7}));
        assert!(outcome.is_sent());

        let frame = server.recv_frame().await.unwrap();
        assert_eq!(frame["type"], "stats_update");
        assert_eq!(frame["payload"]["cpu"], 0.7);
        assert!(
            frame["timestamp"].as_str().is_some(),
            "frame should carry a timestamp"
        );
    }

    #[tokio::test]
    async fn compressed_send_round_trips_over_the_wire() {
        let mut server = MockChannelServer::start().await;
        let client = ChannelClient::new(&server.ws_url(), quick_config()).unwrap();

        client.connect();
        wait_connected(&client).await;

        let outcome = client.send_compressed("stats_update", json!({"bytes_rx": 123_456}));
        assert!(outcome.is_sent());

        let frame = server.recv_frame().await.unwrap();
        assert_eq!(frame["type"], "stats_update");
        assert_eq!(frame["payload"]["bytes_rx"], 123_456);
    }

    #[tokio::test]
    async fn malformed_inbound_frame_does_not_drop_connection() {
        let server = MockChannelServer::start().await;
        let client = ChannelClient::new(&server.ws_url(), quick_config()).unwrap();

        let mut alerts = event_channel(&client, EventKind::Alert);

        client.connect();
        wait_connected(&client).await;

        server.send("this is not json");
        server.send(&json!({"type": "unknown_kind", "payload": {}}).to_string());
        server.send(&json!({"type": "alert", "payload": {"n": 1}}).to_string());

        // Only the valid known frame arrives, on the same connection
        let event = next_event(&mut alerts).await;
        assert!(matches!(event, ChannelEvent::Alert(_)));
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test]
    async fn callback_panic_does_not_starve_other_callbacks() {
        let server = MockChannelServer::start().await;
        let client = ChannelClient::new(&server.ws_url(), quick_config()).unwrap();

        client.subscribe(EventKind::Alert, |_| panic!("misbehaving subscriber"));
        let mut alerts = event_channel(&client, EventKind::Alert);

        client.connect();
        wait_connected(&client).await;

        server.send(&json!({"type": "alert", "payload": {"n": 1}}).to_string());

        let event = next_event(&mut alerts).await;
        assert!(matches!(event, ChannelEvent::Alert(_)));

        // The connection survives the panic too
        server.send(&json!({"type": "alert", "payload": {"n": 2}}).to_string());
        let event = next_event(&mut alerts).await;
        assert!(matches!(event, ChannelEvent::Alert(_)));
    }
}

mod subscriptions {
    use super::*;

    #[tokio::test]
    async fn replays_topics_in_order_after_connect() {
        let mut server = MockChannelServer::start().await;
        let client = ChannelClient::new(&server.ws_url(), quick_config()).unwrap();

        client.subscribe_topic("alerts");
        client.subscribe_topic("stats");
        client.connect();

        let first = server.recv_frame().await.unwrap();
        assert_eq!(first["type"], "subscribe");
        assert_eq!(first["payload"]["topic"], "alerts");

        let second = server.recv_frame().await.unwrap();
        assert_eq!(second["type"], "subscribe");
        assert_eq!(second["payload"]["topic"], "stats");
    }

    #[tokio::test]
    async fn replays_every_topic_after_reconnect() {
        let mut server = MockChannelServer::start().await;
        let client = ChannelClient::new(&server.ws_url(), quick_config()).unwrap();

        client.subscribe_topic("alerts");
        client.subscribe_topic("stats");
        client.connect();

        // Initial replay
        for expected in ["alerts", "stats"] {
            let frame = server.recv_frame().await.unwrap();
            assert_eq!(frame["payload"]["topic"], expected);
        }

        server.disconnect_all();
        tokio::time::sleep(Duration::from_millis(100)).await;
        server.allow_reconnect();

        // Exactly one subscribe frame per topic on the new connection
        for expected in ["alerts", "stats"] {
            let frame = server.recv_frame().await.unwrap();
            assert_eq!(frame["type"], "subscribe");
            assert_eq!(frame["payload"]["topic"], expected);
        }
        assert!(server.connection_count() >= 2, "client should have reconnected");
    }

    #[tokio::test]
    async fn unsubscribed_topic_is_not_replayed() {
        let mut server = MockChannelServer::start().await;
        let client = ChannelClient::new(&server.ws_url(), quick_config()).unwrap();

        client.subscribe_topic("alerts");
        client.subscribe_topic("stats");
        client.connect();

        for _ in 0..2 {
            let _: Option<Value> = server.recv_frame().await;
        }

        client.unsubscribe_topic("alerts");
        let unsub = server.recv_frame().await.unwrap();
        assert_eq!(unsub["type"], "unsubscribe");
        assert_eq!(unsub["payload"]["topic"], "alerts");

        server.disconnect_all();
        tokio::time::sleep(Duration::from_millis(100)).await;
        server.allow_reconnect();

        // Only the surviving topic comes back
        let frame = server.recv_frame().await.unwrap();
        assert_eq!(frame["type"], "subscribe");
        assert_eq!(frame["payload"]["topic"], "stats");
    }
}

mod buffering {
    use super::*;

    #[tokio::test]
    async fn buffered_messages_flush_in_fifo_order_on_connect() {
        let mut server = MockChannelServer::start().await;
        let client = ChannelClient::new(&server.ws_url(), quick_config()).unwrap();

        for n in 0..3 {
            let outcome = client.send("stats_update", json!({"seq": n}));
            assert!(!outcome.is_sent(), "must buffer while disconnected");
        }
        assert_eq!(client.status().buffer_size, 3);

        client.connect();

        for expected in 0..3 {
            let frame = server.recv_frame().await.unwrap();
            assert_eq!(frame["payload"]["seq"], expected);
        }
        assert_eq!(client.status().buffer_size, 0);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_before_flush() {
        let mut server = MockChannelServer::start().await;
        let mut config = quick_config();
        config.buffer_capacity = 2;
        let client = ChannelClient::new(&server.ws_url(), config).unwrap();

        for n in 0..5 {
            client.send("stats_update", json!({"seq": n}));
        }

        client.connect();

        // Only the two newest survive, still in order
        let frame = server.recv_frame().await.unwrap();
        assert_eq!(frame["payload"]["seq"], 3);
        let frame = server.recv_frame().await.unwrap();
        assert_eq!(frame["payload"]["seq"], 4);
    }

    #[tokio::test]
    async fn connected_notice_follows_the_flush() {
        let mut server = MockChannelServer::start().await;
        let client = ChannelClient::new(&server.ws_url(), quick_config()).unwrap();

        client.subscribe_topic("alerts");
        for n in 0..3 {
            client.send("stats_update", json!({"seq": n}));
        }

        // Snapshot the buffer the moment the connected notice is dispatched
        let (tx, mut rx) = mpsc::unbounded_channel();
        let observer = client.clone();
        client.subscribe(EventKind::Connection, move |_| {
            drop(tx.send(observer.status().buffer_size));
        });

        client.connect();

        let buffered_at_notice = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for connection notice")
            .unwrap();
        assert_eq!(
            buffered_at_notice, 0,
            "connected must not be announced before the buffer drains"
        );

        // The flushed traffic still arrives first and in order
        let first = server.recv_frame().await.unwrap();
        assert_eq!(first["type"], "subscribe");
        for expected in 0..3 {
            let frame = server.recv_frame().await.unwrap();
            assert_eq!(frame["payload"]["seq"], expected);
        }
    }

    #[tokio::test]
    async fn subscriptions_flush_before_buffered_messages() {
        let mut server = MockChannelServer::start().await;
        let client = ChannelClient::new(&server.ws_url(), quick_config()).unwrap();

        client.send("stats_update", json!({"seq": 0}));
        client.subscribe_topic("alerts");
        client.connect();

        let first = server.recv_frame().await.unwrap();
        assert_eq!(
            first["type"], "subscribe",
            "subscriptions must precede buffered traffic"
        );
        let second = server.recv_frame().await.unwrap();
        assert_eq!(second["type"], "stats_update");
    }
}

mod liveness {
    use super::*;

    fn heartbeat_config() -> Config {
        let mut config = quick_config();
        config.ping_interval = Duration::from_millis(50);
        config.pong_timeout = Duration::from_millis(100);
        config
    }

    #[tokio::test]
    async fn missing_pong_forces_reconnect() {
        let server = MockChannelServer::start().await;
        server.stop_answering_pings();

        let client = ChannelClient::new(&server.ws_url(), heartbeat_config()).unwrap();
        let mut timeouts = event_channel(&client, EventKind::PongTimeout);

        client.connect();
        wait_connected(&client).await;

        let event = next_event(&mut timeouts).await;
        assert_eq!(event, ChannelEvent::PongTimeout);

        // The dead connection is replaced
        timeout(Duration::from_secs(2), async {
            while server.connection_count() < 2 {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .expect("client should reconnect after pong timeout");
    }

    #[tokio::test]
    async fn answered_pings_keep_the_connection_alive() {
        let server = MockChannelServer::start().await;
        let client = ChannelClient::new(&server.ws_url(), heartbeat_config()).unwrap();

        client.connect();
        wait_connected(&client).await;

        // Several heartbeat cycles pass without a reconnect
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(client.state().is_connected());
        assert_eq!(server.connection_count(), 1);
    }
}

mod logging {
    use std::sync::Mutex;

    use tracing_subscriber::layer::SubscriberExt as _;

    use super::*;

    /// Unknown inbound types must be logged and dropped without touching
    /// the connection. Captures the warn output to prove the log fires.
    #[tokio::test]
    async fn unknown_inbound_type_logs_a_warning() {
        let captured: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);

        let layer = tracing_subscriber::fmt::layer()
            .with_writer(move || {
                struct CaptureWriter(Arc<Mutex<Vec<String>>>);
                impl std::io::Write for CaptureWriter {
                    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                        if let Ok(s) = std::str::from_utf8(buf) {
                            self.0.lock().unwrap().push(s.to_owned());
                        }
                        Ok(buf.len())
                    }
                    fn flush(&mut self) -> std::io::Result<()> {
                        Ok(())
                    }
                }
                CaptureWriter(Arc::clone(&sink))
            })
            .with_ansi(false);

        // Thread-local default; the single-threaded test runtime keeps the
        // connection task on this thread so its events are captured
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(layer));

        let server = MockChannelServer::start().await;
        let client = ChannelClient::new(&server.ws_url(), quick_config()).unwrap();
        let mut alerts = event_channel(&client, EventKind::Alert);

        client.connect();
        wait_connected(&client).await;

        server.send(&json!({"type": "mystery", "payload": {}}).to_string());
        server.send(&json!({"type": "alert", "payload": {"n": 1}}).to_string());

        // The alert after the unknown frame proves the connection survived
        let event = next_event(&mut alerts).await;
        assert!(matches!(event, ChannelEvent::Alert(_)));

        let output = captured.lock().unwrap().join("");
        assert!(
            output.contains("unknown inbound event type"),
            "expected a warn entry for the dropped frame, captured: {output}"
        );
    }
}

mod reconnection {
    use super::*;

    /// Bind and drop a listener so the port refuses connections.
    async fn dead_endpoint() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{addr}/channel")
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let endpoint = dead_endpoint().await;

        let mut config = quick_config();
        config.reconnect.max_attempts = Some(2);
        config.reconnect.initial_backoff = Duration::from_millis(10);
        config.reconnect.max_backoff = Duration::from_millis(20);

        let client = ChannelClient::new(&endpoint, config).unwrap();
        let mut notices = event_channel(&client, EventKind::Connection);

        client.connect();

        let mut state_rx = client.state_receiver();
        timeout(
            Duration::from_secs(2),
            state_rx.wait_for(|state| state.is_closed()),
        )
        .await
        .expect("retries should exhaust quickly")
        .unwrap();

        let notice = next_event(&mut notices).await;
        let ChannelEvent::Connection(notice) = notice else {
            panic!("expected connection notice, got {notice:?}");
        };
        assert_eq!(notice.status, LinkStatus::Failed);
        assert!(!client.status().connected);
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_retries() {
        let endpoint = dead_endpoint().await;

        let mut config = quick_config();
        config.reconnect.max_attempts = None;
        config.reconnect.initial_backoff = Duration::from_millis(100);

        let client = ChannelClient::new(&endpoint, config).unwrap();
        client.connect();

        // Let at least one attempt fail, then close mid-backoff
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.disconnect();

        assert!(client.state().is_closed());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(client.state().is_closed(), "no retry may resurrect the client");
    }

    #[tokio::test]
    async fn connect_after_terminal_failure_starts_fresh() {
        let mut server = MockChannelServer::start().await;
        let client = ChannelClient::new(&server.ws_url(), quick_config()).unwrap();

        client.connect();
        wait_connected(&client).await;
        client.disconnect();
        assert_eq!(client.state(), ChannelState::Closed);

        client.subscribe_topic("alerts");
        client.connect();
        wait_connected(&client).await;

        let frame = server.recv_frame().await.unwrap();
        assert_eq!(frame["type"], "subscribe");
        assert_eq!(frame["payload"]["topic"], "alerts");
    }
}
