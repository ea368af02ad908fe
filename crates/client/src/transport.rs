//! Real-time channel client
//!
//! Maintains at most one live WebSocket connection to the workflow server
//! per instance, with a typed handler registry and automatic recovery from
//! unexpected drops: fixed-interval reconnect attempts up to a bounded
//! count, then a terminal `Failed` phase surfaced through the phase watch.
//!
//! Created once at the composition root and injected as an `Arc`.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use gtmintel_protocol::{ClientMessage, EventKind, ServerMessage, ANONYMOUS_USER};

use crate::config::SyncConfig;
use crate::error::TransportError;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

type EventHandler = Arc<dyn Fn(&ServerMessage) + Send + Sync>;
type ReconnectHook = Arc<dyn Fn() + Send + Sync>;

/// Connection phase, observable through [`Transport::phase_watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts exhausted. No further timers fire; a manual
    /// `connect()` is required to leave this state.
    Failed,
}

/// Identifies a registered handler so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

/// Messages flowing to the writer task
enum Outbound {
    Event(ClientMessage),
    Close,
}

/// WebSocket client for the workflow server's event channel
pub struct Transport {
    config: SyncConfig,
    phase_tx: watch::Sender<Phase>,
    writer: Mutex<Option<mpsc::Sender<Outbound>>>,
    handlers: Mutex<HashMap<EventKind, Vec<(HandlerId, EventHandler)>>>,
    reconnect_hooks: Mutex<Vec<(HandlerId, ReconnectHook)>>,
    identity_hint: Mutex<String>,
    retry_count: AtomicU32,
    next_handler_id: AtomicU64,
}

impl Transport {
    pub fn new(config: SyncConfig) -> Arc<Self> {
        let (phase_tx, _) = watch::channel(Phase::Disconnected);
        Arc::new(Self {
            config,
            phase_tx,
            writer: Mutex::new(None),
            handlers: Mutex::new(HashMap::new()),
            reconnect_hooks: Mutex::new(Vec::new()),
            identity_hint: Mutex::new(ANONYMOUS_USER.to_string()),
            retry_count: AtomicU32::new(0),
            next_handler_id: AtomicU64::new(1),
        })
    }

    /// Current connection phase.
    pub fn phase(&self) -> Phase {
        *self.phase_tx.borrow()
    }

    /// Watch channel over the connection phase. The terminal `Failed`
    /// phase is surfaced here so the host can report it to the user.
    pub fn phase_watch(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    /// Open the connection. Idempotent: while a handshake is in flight or
    /// established, concurrent calls await the same outcome instead of
    /// dialing a second socket.
    ///
    /// On success the retry counter resets and, after a short settle
    /// delay, a `join-session` for `identity_hint` is emitted unless the
    /// hint is the anonymous placeholder.
    pub async fn connect(
        self: &Arc<Self>,
        identity_hint: &str,
    ) -> Result<(), TransportError> {
        *self
            .identity_hint
            .lock()
            .expect("identity_hint lock poisoned") = identity_hint.to_string();

        loop {
            let mut rx = self.phase_tx.subscribe();
            let phase = *rx.borrow();
            match phase {
                Phase::Connected => return Ok(()),
                Phase::Connecting => {
                    // Another call owns the handshake; share its outcome.
                    while rx.changed().await.is_ok() {
                        let phase = *rx.borrow();
                        match phase {
                            Phase::Connected => return Ok(()),
                            Phase::Connecting => continue,
                            Phase::Disconnected | Phase::Failed => {
                                return Err(TransportError::ConnectFailed)
                            }
                        }
                    }
                    return Err(TransportError::ConnectFailed);
                }
                Phase::Disconnected | Phase::Failed => {
                    let claimed = self.phase_tx.send_if_modified(|p| {
                        if matches!(p, Phase::Disconnected | Phase::Failed) {
                            *p = Phase::Connecting;
                            true
                        } else {
                            false
                        }
                    });
                    if !claimed {
                        // Lost the race; wait on the winner's attempt.
                        continue;
                    }

                    return match self.establish().await {
                        Ok(()) => Ok(()),
                        Err(err) => {
                            self.phase_tx.send_replace(Phase::Disconnected);
                            Err(err)
                        }
                    };
                }
            }
        }
    }

    /// Dial the server and wire up the reader/writer tasks. Caller must
    /// own the `Connecting` phase.
    async fn establish(self: &Arc<Self>) -> Result<(), TransportError> {
        let (ws, _response) = connect_async(self.config.ws_url.as_str()).await?;
        let (sink, stream) = ws.split();

        let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(64);
        *self.writer.lock().expect("writer lock poisoned") = Some(outbound_tx);

        tokio::spawn(writer_task(sink, outbound_rx));
        tokio::spawn(reader_task(Arc::clone(self), stream));

        self.retry_count.store(0, Ordering::SeqCst);
        self.phase_tx.send_replace(Phase::Connected);
        info!(
            component = "transport",
            event = "transport.connected",
            url = %self.config.ws_url,
            "WebSocket connection established"
        );

        // Let the handshake settle before joining the identity channel.
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(transport.config.join_delay).await;
            let hint = transport
                .identity_hint
                .lock()
                .expect("identity_hint lock poisoned")
                .clone();
            if hint != ANONYMOUS_USER && transport.phase() == Phase::Connected {
                transport.send(ClientMessage::join(hint));
            }
        });

        Ok(())
    }

    /// Transmit an event envelope if connected; otherwise drop it with a
    /// warning. There is no send queue — the lifecycle controller replays
    /// joins after reconnection instead.
    pub fn send(&self, msg: ClientMessage) {
        let writer = self
            .writer
            .lock()
            .expect("writer lock poisoned")
            .clone();
        match writer {
            Some(tx) => {
                if tx.try_send(Outbound::Event(msg)).is_err() {
                    warn!(
                        component = "transport",
                        event = "transport.send.channel_full",
                        "Outbound channel full or closed, message dropped"
                    );
                }
            }
            None => {
                warn!(
                    component = "transport",
                    event = "transport.send.not_connected",
                    "Not connected, message dropped"
                );
            }
        }
    }

    /// Close with a normal-closure frame and fully reset internal state
    /// so a subsequent `connect` starts clean.
    pub fn disconnect(&self) {
        self.phase_tx.send_replace(Phase::Disconnected);
        self.retry_count.store(0, Ordering::SeqCst);

        let writer = self
            .writer
            .lock()
            .expect("writer lock poisoned")
            .take();
        if let Some(tx) = writer {
            let _ = tx.try_send(Outbound::Close);
        }
        info!(
            component = "transport",
            event = "transport.disconnected",
            "WebSocket connection closed by client"
        );
    }

    /// Register a handler for one event kind. Handlers run in
    /// registration order; a panicking handler never prevents its
    /// siblings from running.
    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&ServerMessage) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .expect("handlers lock poisoned")
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a previously registered handler.
    pub fn off(&self, kind: EventKind, id: HandlerId) {
        if let Some(entries) = self
            .handlers
            .lock()
            .expect("handlers lock poisoned")
            .get_mut(&kind)
        {
            entries.retain(|(entry_id, _)| *entry_id != id);
        }
    }

    /// Register a hook fired only on successful automatic reconnection —
    /// distinct from the generic event registry, so dependents can re-sync
    /// state before re-joining.
    pub fn on_reconnect(&self, hook: impl Fn() + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.reconnect_hooks
            .lock()
            .expect("reconnect_hooks lock poisoned")
            .push((id, Arc::new(hook)));
        id
    }

    pub fn off_reconnect(&self, id: HandlerId) {
        self.reconnect_hooks
            .lock()
            .expect("reconnect_hooks lock poisoned")
            .retain(|(entry_id, _)| *entry_id != id);
    }

    /// Invoke all handlers registered for the message's kind, each
    /// isolated from the others.
    pub(crate) fn dispatch(&self, msg: &ServerMessage) {
        let entries: Vec<(HandlerId, EventHandler)> = self
            .handlers
            .lock()
            .expect("handlers lock poisoned")
            .get(&msg.kind())
            .map(|entries| entries.to_vec())
            .unwrap_or_default();

        for (id, handler) in entries {
            if catch_unwind(AssertUnwindSafe(|| handler(msg))).is_err() {
                error!(
                    component = "transport",
                    event = "transport.handler.panicked",
                    kind = ?msg.kind(),
                    handler_id = id.0,
                    "Event handler panicked; continuing with remaining handlers"
                );
            }
        }
    }

    fn run_reconnect_hooks(&self) {
        let hooks: Vec<(HandlerId, ReconnectHook)> = self
            .reconnect_hooks
            .lock()
            .expect("reconnect_hooks lock poisoned")
            .to_vec();

        for (id, hook) in hooks {
            if catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
                error!(
                    component = "transport",
                    event = "transport.reconnect_hook.panicked",
                    handler_id = id.0,
                    "Reconnect hook panicked; continuing with remaining hooks"
                );
            }
        }
    }

    /// Schedule the next reconnect attempt, or give up once the bounded
    /// attempt count is exhausted.
    fn schedule_reconnect(self: &Arc<Self>) {
        let attempt = self.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.config.max_reconnect_attempts {
            warn!(
                component = "transport",
                event = "transport.reconnect.exhausted",
                attempts = self.config.max_reconnect_attempts,
                "Giving up on reconnection"
            );
            self.phase_tx.send_replace(Phase::Failed);
            return;
        }

        info!(
            component = "transport",
            event = "transport.reconnect.scheduled",
            attempt,
            max_attempts = self.config.max_reconnect_attempts,
            delay_ms = self.config.reconnect_interval.as_millis() as u64,
            "Scheduling reconnect attempt"
        );

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(transport.config.reconnect_interval).await;

            // A manual connect/disconnect may have raced the timer.
            let claimed = transport.phase_tx.send_if_modified(|p| {
                if *p == Phase::Disconnected {
                    *p = Phase::Connecting;
                    true
                } else {
                    false
                }
            });
            if !claimed {
                return;
            }

            match transport.establish().await {
                Ok(()) => {
                    info!(
                        component = "transport",
                        event = "transport.reconnect.succeeded",
                        attempt,
                        "Reconnected"
                    );
                    transport.run_reconnect_hooks();
                }
                Err(err) => {
                    warn!(
                        component = "transport",
                        event = "transport.reconnect.attempt_failed",
                        attempt,
                        error = %err,
                        "Reconnect attempt failed"
                    );
                    transport.phase_tx.send_replace(Phase::Disconnected);
                    transport.schedule_reconnect();
                }
            }
        });
    }
}

async fn writer_task(mut sink: WsSink, mut outbound_rx: mpsc::Receiver<Outbound>) {
    while let Some(out) = outbound_rx.recv().await {
        let result = match out {
            Outbound::Event(msg) => match serde_json::to_string(&msg) {
                Ok(json) => sink.send(Message::Text(json.into())).await,
                Err(e) => {
                    error!(
                        component = "transport",
                        event = "transport.send.serialize_failed",
                        error = %e,
                        "Failed to serialize client message"
                    );
                    continue;
                }
            },
            Outbound::Close => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client disconnect".into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        };

        if result.is_err() {
            debug!(
                component = "transport",
                event = "transport.send.disconnected",
                "WebSocket send failed, connection is gone"
            );
            break;
        }
    }
}

async fn reader_task(transport: Arc<Transport>, mut stream: WsStream) {
    let mut normal_close = false;

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let msg: ServerMessage = match serde_json::from_str(text.as_str()) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(
                            component = "transport",
                            event = "transport.message.parse_failed",
                            error = %e,
                            payload_bytes = text.len(),
                            "Failed to parse server message"
                        );
                        continue;
                    }
                };
                transport.dispatch(&msg);
            }
            Ok(Message::Close(frame)) => {
                normal_close = frame
                    .map(|f| f.code == CloseCode::Normal)
                    .unwrap_or(false);
                debug!(
                    component = "transport",
                    event = "transport.connection.close_frame",
                    normal = normal_close,
                    "Server sent close frame"
                );
                break;
            }
            // Pings are answered by tungstenite itself on the next write.
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "transport",
                    event = "transport.connection.error",
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        }
    }

    *transport.writer.lock().expect("writer lock poisoned") = None;

    // Only the task that observed the drop while still Connected owns
    // recovery; `disconnect()` flips the phase first, so intentional
    // closes never reconnect.
    let was_connected = transport.phase_tx.send_if_modified(|p| {
        if *p == Phase::Connected {
            *p = Phase::Disconnected;
            true
        } else {
            false
        }
    });

    if was_connected && !normal_close {
        warn!(
            component = "transport",
            event = "transport.connection.dropped",
            "Connection dropped unexpectedly"
        );
        transport.schedule_reconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn test_config(addr: SocketAddr) -> SyncConfig {
        let mut config = SyncConfig::new(
            "http://unused.invalid",
            format!("ws://{}", addr),
            "user-1",
        );
        config.join_delay = Duration::from_millis(10);
        config.reconnect_interval = Duration::from_millis(20);
        config.max_reconnect_attempts = 2;
        config
    }

    /// Server that accepts every connection, counts handshakes, forwards
    /// received text frames, and holds sockets open.
    async fn spawn_holding_server() -> (
        SocketAddr,
        Arc<AtomicUsize>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handshakes = Arc::new(AtomicUsize::new(0));
        let (text_tx, text_rx) = mpsc::unbounded_channel();

        let counter = Arc::clone(&handshakes);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let text_tx = text_tx.clone();
                tokio::spawn(async move {
                    while let Some(Ok(msg)) = ws.next().await {
                        if let Message::Text(text) = msg {
                            let _ = text_tx.send(text.to_string());
                        }
                    }
                });
            }
        });

        (addr, handshakes, text_rx)
    }

    /// Server that accepts exactly one connection, drops it shortly after
    /// the handshake, then stops listening entirely.
    async fn spawn_drop_once_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    // Let the client finish its side of the handshake.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    drop(ws);
                }
            }
            // Listener dropped here: further dials are refused.
        });
        addr
    }

    async fn await_phase(transport: &Arc<Transport>, want: Phase) {
        let mut rx = transport.phase_watch();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if *rx.borrow() == want {
                    return;
                }
                rx.changed().await.expect("phase channel closed");
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for phase {:?}", want));
    }

    #[tokio::test]
    async fn rapid_double_connect_performs_single_handshake() {
        let (addr, handshakes, _rx) = spawn_holding_server().await;
        let transport = Transport::new(test_config(addr));

        let (a, b) = tokio::join!(
            transport.connect(ANONYMOUS_USER),
            transport.connect(ANONYMOUS_USER)
        );
        a.expect("first connect");
        b.expect("second connect");

        // Give the server a beat to register any (erroneous) second dial.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handshakes.load(Ordering::SeqCst), 1);
        assert_eq!(transport.phase(), Phase::Connected);
    }

    #[tokio::test]
    async fn disconnect_then_connect_starts_clean() {
        let (addr, handshakes, _rx) = spawn_holding_server().await;
        let transport = Transport::new(test_config(addr));

        transport.connect(ANONYMOUS_USER).await.expect("connect");
        transport.disconnect();
        await_phase(&transport, Phase::Disconnected).await;

        transport.connect(ANONYMOUS_USER).await.expect("reconnect");
        assert_eq!(transport.phase(), Phase::Connected);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handshakes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn connect_auto_joins_identity_channel() {
        let (addr, _handshakes, mut text_rx) = spawn_holding_server().await;
        let transport = Transport::new(test_config(addr));

        transport.connect("user-42").await.expect("connect");

        let joined = tokio::time::timeout(Duration::from_secs(2), text_rx.recv())
            .await
            .expect("join message never arrived")
            .expect("channel closed");
        assert_eq!(
            joined,
            r#"{"type":"join-session","sessionId":"user-42"}"#
        );
    }

    #[tokio::test]
    async fn anonymous_hint_skips_auto_join() {
        let (addr, _handshakes, mut text_rx) = spawn_holding_server().await;
        let transport = Transport::new(test_config(addr));

        transport.connect(ANONYMOUS_USER).await.expect("connect");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(text_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_while_disconnected_is_dropped() {
        let config = SyncConfig::new("http://unused.invalid", "ws://127.0.0.1:1", "user-1");
        let transport = Transport::new(config);

        // Must not panic or error; the message is logged and dropped.
        transport.send(ClientMessage::join("sess-1"));
        assert_eq!(transport.phase(), Phase::Disconnected);
    }

    #[tokio::test]
    async fn reconnect_gives_up_after_max_attempts() {
        let addr = spawn_drop_once_server().await;
        let transport = Transport::new(test_config(addr));

        transport.connect(ANONYMOUS_USER).await.expect("connect");

        // Server drops the socket; two attempts fail against the closed
        // listener, then the transport goes terminal.
        await_phase(&transport, Phase::Failed).await;

        // No further timers: the phase stays Failed.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.phase(), Phase::Failed);
    }

    #[tokio::test]
    async fn reconnect_hook_fires_on_recovery_not_initial_connect() {
        let (addr, handshakes, _rx) = spawn_holding_server().await;
        let transport = Transport::new(test_config(addr));

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        transport.on_reconnect(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        transport.connect(ANONYMOUS_USER).await.expect("connect");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Simulate an unexpected drop: clear the writer and drive the
        // reconnect path the way the reader task would.
        drop(transport.writer.lock().unwrap().take());
        transport.phase_tx.send_replace(Phase::Disconnected);
        transport.schedule_reconnect();

        await_phase(&transport, Phase::Connected).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(handshakes.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order_and_panics_are_isolated() {
        let config = SyncConfig::new("http://unused.invalid", "ws://127.0.0.1:1", "user-1");
        let transport = Transport::new(config);

        let order = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&order);
        transport.on(EventKind::Error, move |_| {
            first.lock().unwrap().push(1);
            panic!("handler one blew up");
        });
        let second = Arc::clone(&order);
        transport.on(EventKind::Error, move |_| {
            second.lock().unwrap().push(2);
        });

        transport.dispatch(&ServerMessage::Error {
            message: "boom".to_string(),
        });

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn off_removes_handler() {
        let config = SyncConfig::new("http://unused.invalid", "ws://127.0.0.1:1", "user-1");
        let transport = Transport::new(config);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = transport.on(EventKind::Connected, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        transport.dispatch(&ServerMessage::Connected);
        transport.off(EventKind::Connected, id);
        transport.dispatch(&ServerMessage::Connected);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
