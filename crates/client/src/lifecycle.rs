//! Session lifecycle controller
//!
//! Keeps the transport's joined channel equal to the store's current
//! session: exactly one leave/join pair per switch, leave always before
//! join. On reconnection it re-fetches session state before re-joining,
//! so the client never joins with stale assumptions.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, info};

use gtmintel_protocol::ClientMessage;

use crate::store::SessionStore;
use crate::transport::{HandlerId, Phase, Transport};

pub struct LifecycleController {
    transport: Arc<Transport>,
    store: Arc<SessionStore>,
    /// Session channel we last joined, if any.
    joined: Mutex<Option<String>>,
    reconnect_hook: Mutex<Option<HandlerId>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleController {
    pub fn new(transport: Arc<Transport>, store: Arc<SessionStore>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            store,
            joined: Mutex::new(None),
            reconnect_hook: Mutex::new(None),
            watcher: Mutex::new(None),
        })
    }

    /// Wire up the watcher task and the reconnect hook. Call once.
    pub fn start(self: &Arc<Self>) {
        let hook = {
            let this = Arc::clone(self);
            self.transport.on_reconnect(move || {
                let this = Arc::clone(&this);
                tokio::spawn(async move {
                    // Refresh first: a join against stale state is worse
                    // than a late join.
                    this.store.refresh_sessions().await;
                    this.rejoin();
                });
            })
        };
        *self
            .reconnect_hook
            .lock()
            .expect("reconnect_hook lock poisoned") = Some(hook);

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut revision = this.store.revision_watch();
            let mut phase = this.transport.phase_watch();
            this.sync_active();
            loop {
                tokio::select! {
                    changed = revision.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        this.sync_active();
                    }
                    changed = phase.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *phase.borrow() == Phase::Connected {
                            // A fresh socket knows nothing about prior
                            // joins; replay the current one.
                            this.rejoin();
                        }
                    }
                }
            }
        });
        *self.watcher.lock().expect("watcher lock poisoned") = Some(handle);

        info!(
            component = "lifecycle",
            event = "lifecycle.started",
            "Session lifecycle controller started"
        );
    }

    /// Bring the joined channel in line with the store's current session.
    /// Leave-before-join ordering is guaranteed by sending both from this
    /// single synchronous section.
    pub fn sync_active(&self) {
        let current = self.store.snapshot().current_id.clone();
        let mut joined = self.joined.lock().expect("joined lock poisoned");
        if *joined == current {
            return;
        }

        if let Some(old) = joined.take() {
            debug!(
                component = "lifecycle",
                event = "lifecycle.leave",
                session_id = %old,
                "Leaving session channel"
            );
            self.transport.send(ClientMessage::leave(old));
        }
        if let Some(new) = &current {
            debug!(
                component = "lifecycle",
                event = "lifecycle.join",
                session_id = %new,
                "Joining session channel"
            );
            self.transport.send(ClientMessage::join(new.clone()));
        }
        *joined = current;
    }

    /// Re-send the join for whatever channel we believe we are in.
    fn rejoin(&self) {
        let joined = self
            .joined
            .lock()
            .expect("joined lock poisoned")
            .clone();
        if let Some(id) = joined {
            debug!(
                component = "lifecycle",
                event = "lifecycle.rejoin",
                session_id = %id,
                "Re-joining session channel"
            );
            self.transport.send(ClientMessage::join(id));
        }
    }

    /// Tear down: stop watching and send a final leave for cleanup.
    pub fn shutdown(&self) {
        if let Some(handle) = self.watcher.lock().expect("watcher lock poisoned").take() {
            handle.abort();
        }
        if let Some(hook) = self
            .reconnect_hook
            .lock()
            .expect("reconnect_hook lock poisoned")
            .take()
        {
            self.transport.off_reconnect(hook);
        }
        if let Some(id) = self.joined.lock().expect("joined lock poisoned").take() {
            self.transport.send(ClientMessage::leave(id));
        }
        info!(
            component = "lifecycle",
            event = "lifecycle.stopped",
            "Session lifecycle controller stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;
    use chrono::Utc;
    use futures::StreamExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    use gtmintel_protocol::{Session, ANONYMOUS_USER};

    use crate::config::SyncConfig;
    use crate::rest::RestClient;

    /// Holds every accepted socket open and forwards received text frames.
    /// When `drop_first` is set, the first connection is severed shortly
    /// after the handshake to force the reconnect path.
    async fn spawn_server(drop_first: bool) -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (text_tx, text_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut first = true;
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                if drop_first && first {
                    first = false;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    drop(ws);
                    continue;
                }
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

        (addr, text_rx)
    }

    fn harness(addr: SocketAddr) -> (Arc<Transport>, Arc<SessionStore>) {
        let mut config = SyncConfig::new(
            "http://127.0.0.1:9",
            format!("ws://{}", addr),
            "user-1",
        );
        config.join_delay = Duration::from_millis(10);
        config.reconnect_interval = Duration::from_millis(30);
        config.max_reconnect_attempts = 3;
        config.request_timeout = Duration::from_millis(200);

        let transport = Transport::new(config.clone());
        let rest = RestClient::new(
            config.rest_base_url.clone(),
            config.user_id.clone(),
            config.request_timeout,
        )
        .expect("rest client");
        let store = SessionStore::new(rest, None);
        (transport, store)
    }

    fn session(id: &str) -> Session {
        Session::new(id.to_string(), format!("session {}", id), Utc::now())
    }

    async fn recv_text(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("server channel closed")
    }

    #[tokio::test]
    async fn session_switch_sends_leave_before_join() {
        let (addr, mut messages) = spawn_server(false).await;
        let (transport, store) = harness(addr);
        store.seed(vec![session("s1"), session("s2")], Vec::new());

        transport.connect(ANONYMOUS_USER).await.expect("connect");
        let controller = LifecycleController::new(Arc::clone(&transport), Arc::clone(&store));
        controller.start();

        store.set_current(Some("s1"));
        assert_eq!(
            recv_text(&mut messages).await,
            r#"{"type":"join-session","sessionId":"s1"}"#
        );

        store.set_current(Some("s2"));
        assert_eq!(
            recv_text(&mut messages).await,
            r#"{"type":"leave-session","sessionId":"s1"}"#
        );
        assert_eq!(
            recv_text(&mut messages).await,
            r#"{"type":"join-session","sessionId":"s2"}"#
        );
    }

    #[tokio::test]
    async fn shutdown_sends_final_leave() {
        let (addr, mut messages) = spawn_server(false).await;
        let (transport, store) = harness(addr);
        store.seed(vec![session("s1")], Vec::new());

        transport.connect(ANONYMOUS_USER).await.expect("connect");
        let controller = LifecycleController::new(Arc::clone(&transport), Arc::clone(&store));
        controller.start();

        store.set_current(Some("s1"));
        assert_eq!(
            recv_text(&mut messages).await,
            r#"{"type":"join-session","sessionId":"s1"}"#
        );

        controller.shutdown();
        assert_eq!(
            recv_text(&mut messages).await,
            r#"{"type":"leave-session","sessionId":"s1"}"#
        );
    }

    #[tokio::test]
    async fn reconnect_replays_join_on_fresh_socket() {
        let (addr, mut messages) = spawn_server(true).await;
        let (transport, store) = harness(addr);
        store.seed(vec![session("s1")], Vec::new());

        transport.connect(ANONYMOUS_USER).await.expect("connect");
        let controller = LifecycleController::new(Arc::clone(&transport), Arc::clone(&store));
        controller.start();
        store.set_current(Some("s1"));

        // First socket is dropped by the server; after reconnection the
        // join for the current session must land on the fresh socket.
        let mut saw_join = false;
        for _ in 0..4 {
            let msg = recv_text(&mut messages).await;
            if msg == r#"{"type":"join-session","sessionId":"s1"}"# {
                saw_join = true;
                break;
            }
        }
        assert!(saw_join, "join for current session never replayed");
    }

    #[tokio::test]
    async fn no_join_without_current_session() {
        let (addr, mut messages) = spawn_server(false).await;
        let (transport, store) = harness(addr);
        store.seed(vec![session("s1")], Vec::new());

        transport.connect(ANONYMOUS_USER).await.expect("connect");
        let controller = LifecycleController::new(Arc::clone(&transport), Arc::clone(&store));
        controller.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(messages.try_recv().is_err());
    }
}
